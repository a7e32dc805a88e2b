use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A structured table payload: a column-name header plus rows of typed
/// cells. Used for `GET_TABLE` replies and SNMP-table data elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<FieldValue>>,
}

impl Table {
    pub fn new(columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<FieldValue>) {
        self.rows.push(row);
    }
}

/// One typed value carried in a message field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Int16(u16),
    Int32(u32),
    Int64(u64),
    Str(String),
    Guid(Uuid),
    Binary(Vec<u8>),
    Table(Table),
}

impl From<u16> for FieldValue {
    fn from(v: u16) -> Self {
        Self::Int16(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        Self::Int32(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        Self::Int64(v)
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<Uuid> for FieldValue {
    fn from(v: Uuid) -> Self {
        Self::Guid(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        Self::Binary(v)
    }
}

impl From<Table> for FieldValue {
    fn from(v: Table) -> Self {
        Self::Table(v)
    }
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Self::Int32(v) => Some(*v),
            Self::Int16(v) => Some(*v as u32),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Int64(v) => Some(*v),
            Self::Int32(v) => Some(*v as u64),
            Self::Int16(v) => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Self::Table(t) => Some(t),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_accessor_round_trips() {
        let mut table = Table::new(["name", "value"]);
        table.push_row(vec![FieldValue::Str("cpu".into()), FieldValue::Int32(42)]);
        let field: FieldValue = table.clone().into();
        assert_eq!(field.as_table().unwrap().rows.len(), 1);
    }
}
