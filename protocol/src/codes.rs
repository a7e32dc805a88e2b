use serde::{Deserialize, Serialize};

/// The wire vocabulary of request/reply/notification codes the daemon and
/// its servers speak. Grouped by responsibility per the external-interface
/// contract; `Unknown` preserves forward compatibility with codes this
/// build doesn't recognize instead of failing to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageCode {
    // Generic
    RequestCompleted,
    Keepalive,

    // Setup / tunnel liveness
    SetupAgentTunnel,
    ResetTunnel,
    BindAgentTunnel,
    RequestCertificate,
    NewCertificate,

    // Session
    Authenticate,

    // Metrics
    GetParameter,
    GetList,
    GetTable,
    GetParameterList,
    GetEnumList,
    GetTableList,

    // Data collection
    ConfigureDataCollection,
    DciData,

    // Proxies & channels
    CreateChannel,
    ChannelData,
    CloseChannel,
    SetupProxyConnection,
    CloseTcpProxy,
    TcpProxyData,
    SnmpRequest,
    SnmpTrap,
    SyslogRecords,

    // Files, actions, packages, policies, AI tools
    UploadFile,
    GetFile,
    CancelFileMonitoring,
    Action,
    InstallPackage,
    DeployPolicy,
    UninstallPolicy,
    GetPolicyInventory,
    ExecuteAiTool,
    GetAiToolSchema,

    /// Code this build doesn't assign a named variant to yet.
    Unknown(u16),
}

impl MessageCode {
    pub fn as_u16(self) -> u16 {
        match self {
            Self::RequestCompleted => 1,
            Self::Keepalive => 2,
            Self::SetupAgentTunnel => 3,
            Self::ResetTunnel => 4,
            Self::BindAgentTunnel => 5,
            Self::RequestCertificate => 6,
            Self::NewCertificate => 7,
            Self::Authenticate => 8,
            Self::GetParameter => 9,
            Self::GetList => 10,
            Self::GetTable => 11,
            Self::GetParameterList => 12,
            Self::GetEnumList => 13,
            Self::GetTableList => 14,
            Self::ConfigureDataCollection => 15,
            Self::DciData => 16,
            Self::CreateChannel => 17,
            Self::ChannelData => 18,
            Self::CloseChannel => 19,
            Self::SetupProxyConnection => 20,
            Self::CloseTcpProxy => 21,
            Self::TcpProxyData => 22,
            Self::SnmpRequest => 23,
            Self::SnmpTrap => 24,
            Self::SyslogRecords => 25,
            Self::UploadFile => 26,
            Self::GetFile => 27,
            Self::CancelFileMonitoring => 28,
            Self::Action => 29,
            Self::InstallPackage => 30,
            Self::DeployPolicy => 31,
            Self::UninstallPolicy => 32,
            Self::GetPolicyInventory => 33,
            Self::ExecuteAiTool => 34,
            Self::GetAiToolSchema => 35,
            Self::Unknown(code) => code,
        }
    }

    pub fn from_u16(code: u16) -> Self {
        match code {
            1 => Self::RequestCompleted,
            2 => Self::Keepalive,
            3 => Self::SetupAgentTunnel,
            4 => Self::ResetTunnel,
            5 => Self::BindAgentTunnel,
            6 => Self::RequestCertificate,
            7 => Self::NewCertificate,
            8 => Self::Authenticate,
            9 => Self::GetParameter,
            10 => Self::GetList,
            11 => Self::GetTable,
            12 => Self::GetParameterList,
            13 => Self::GetEnumList,
            14 => Self::GetTableList,
            15 => Self::ConfigureDataCollection,
            16 => Self::DciData,
            17 => Self::CreateChannel,
            18 => Self::ChannelData,
            19 => Self::CloseChannel,
            20 => Self::SetupProxyConnection,
            21 => Self::CloseTcpProxy,
            22 => Self::TcpProxyData,
            23 => Self::SnmpRequest,
            24 => Self::SnmpTrap,
            25 => Self::SyslogRecords,
            26 => Self::UploadFile,
            27 => Self::GetFile,
            28 => Self::CancelFileMonitoring,
            29 => Self::Action,
            30 => Self::InstallPackage,
            31 => Self::DeployPolicy,
            32 => Self::UninstallPolicy,
            33 => Self::GetPolicyInventory,
            34 => Self::ExecuteAiTool,
            35 => Self::GetAiToolSchema,
            other => Self::Unknown(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_round_trip() {
        for code in [
            MessageCode::GetParameter,
            MessageCode::DciData,
            MessageCode::SnmpRequest,
            MessageCode::ExecuteAiTool,
        ] {
            assert_eq!(MessageCode::from_u16(code.as_u16()), code);
        }
    }

    #[test]
    fn unknown_code_preserved() {
        let code = MessageCode::from_u16(9999);
        assert_eq!(code, MessageCode::Unknown(9999));
        assert_eq!(code.as_u16(), 9999);
    }
}
