//! HCI protocol constants
//!
//! Opcode Group/Command fields, event codes, and ACL framing flags used by
//! the adapter.

// HCI packet indicator bytes
pub const HCI_COMMAND_PKT: u8 = 0x01;
pub const HCI_ACL_PKT: u8 = 0x02;
pub const HCI_EVENT_PKT: u8 = 0x04;

// Opcode Group Fields
pub const OGF_LINK_CTL: u8 = 0x01;
pub const OGF_HOST_CTL: u8 = 0x03;
pub const OGF_INFO_PARAM: u8 = 0x04;
pub const OGF_LE: u8 = 0x08;

/// Composes a 16-bit opcode from its group and command fields.
pub const fn opcode(ogf: u8, ocf: u16) -> u16 {
    ((ogf as u16) << 10) | (ocf & 0x3FF)
}

// Link Control (OGF 0x01)
pub const OCF_DISCONNECT: u16 = 0x0006;
pub const OCF_READ_REMOTE_VERSION: u16 = 0x001D;

// Host Controller (OGF 0x03)
pub const OCF_SET_EVENT_MASK: u16 = 0x0001;
pub const OCF_RESET: u16 = 0x0003;

// Informational (OGF 0x04)
pub const OCF_READ_LOCAL_VERSION: u16 = 0x0001;
pub const OCF_READ_BUFFER_SIZE: u16 = 0x0005;
pub const OCF_READ_BD_ADDR: u16 = 0x0009;

// LE Controller (OGF 0x08)
pub const OCF_LE_SET_EVENT_MASK: u16 = 0x0001;
pub const OCF_LE_READ_BUFFER_SIZE: u16 = 0x0002;
pub const OCF_LE_SET_RANDOM_ADDRESS: u16 = 0x0005;
pub const OCF_LE_SET_ADVERTISING_PARAMETERS: u16 = 0x0006;
pub const OCF_LE_SET_ADVERTISING_DATA: u16 = 0x0008;
pub const OCF_LE_SET_SCAN_RESPONSE_DATA: u16 = 0x0009;
pub const OCF_LE_SET_ADVERTISING_ENABLE: u16 = 0x000A;
pub const OCF_LE_SET_SCAN_PARAMETERS: u16 = 0x000B;
pub const OCF_LE_SET_SCAN_ENABLE: u16 = 0x000C;
pub const OCF_LE_CREATE_CONNECTION: u16 = 0x000D;
pub const OCF_LE_CREATE_CONNECTION_CANCEL: u16 = 0x000E;
pub const OCF_LE_RAND: u16 = 0x0018;
pub const OCF_LE_CONNECTION_UPDATE: u16 = 0x0013;
pub const OCF_LE_READ_REMOTE_FEATURES: u16 = 0x0016;
pub const OCF_LE_START_ENCRYPTION: u16 = 0x0019;
pub const OCF_LE_LTK_REQUEST_REPLY: u16 = 0x001A;
pub const OCF_LE_LTK_REQUEST_NEGATIVE_REPLY: u16 = 0x001B;
pub const OCF_LE_READ_LOCAL_P256_PUBLIC_KEY: u16 = 0x0025;
pub const OCF_LE_GENERATE_DHKEY: u16 = 0x0026;
pub const OCF_LE_SET_PHY: u16 = 0x0032;

// Event codes
pub const EVT_DISCONN_COMPLETE: u8 = 0x05;
pub const EVT_ENCRYPTION_CHANGE: u8 = 0x08;
pub const EVT_READ_REMOTE_VERSION_COMPLETE: u8 = 0x0C;
pub const EVT_CMD_COMPLETE: u8 = 0x0E;
pub const EVT_CMD_STATUS: u8 = 0x0F;
pub const EVT_HARDWARE_ERROR: u8 = 0x10;
pub const EVT_NUM_COMPLETED_PACKETS: u8 = 0x13;
pub const EVT_ENCRYPTION_KEY_REFRESH_COMPLETE: u8 = 0x30;
pub const EVT_LE_META_EVENT: u8 = 0x3E;

// LE meta subevent codes
pub const EVT_LE_CONN_COMPLETE: u8 = 0x01;
pub const EVT_LE_ADVERTISING_REPORT: u8 = 0x02;
pub const EVT_LE_CONN_UPDATE_COMPLETE: u8 = 0x03;
pub const EVT_LE_READ_REMOTE_FEATURES_COMPLETE: u8 = 0x04;
pub const EVT_LE_LONG_TERM_KEY_REQUEST: u8 = 0x05;
pub const EVT_LE_P256_PUBLIC_KEY_COMPLETE: u8 = 0x08;
pub const EVT_LE_GENERATE_DHKEY_COMPLETE: u8 = 0x09;
pub const EVT_LE_ENHANCED_CONN_COMPLETE: u8 = 0x0A;
pub const EVT_LE_PHY_UPDATE_COMPLETE: u8 = 0x0C;
pub const EVT_LE_EXTENDED_ADVERTISING_REPORT: u8 = 0x0D;

// ACL packet-boundary flags (bits 12-13 of the handle word)
pub const ACL_PB_FIRST_NON_FLUSHABLE: u8 = 0b00;
pub const ACL_PB_CONTINUATION: u8 = 0b01;
pub const ACL_PB_FIRST_FLUSHABLE: u8 = 0b10;

/// Largest ACL fragment this host will use, regardless of what the
/// controller reports; some controllers misreport larger values.
pub const ACL_MTU_CAP: usize = 1023;

/// Default LE ACL payload size assumed before buffer-size discovery.
pub const ACL_MTU_DEFAULT: usize = 27;

// Common advertising-data structure types
pub const ADV_TYPE_FLAGS: u8 = 0x01;
pub const ADV_TYPE_INCOMPLETE_16BIT_UUIDS: u8 = 0x02;
pub const ADV_TYPE_COMPLETE_16BIT_UUIDS: u8 = 0x03;
pub const ADV_TYPE_SHORT_LOCAL_NAME: u8 = 0x08;
pub const ADV_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
pub const ADV_TYPE_TX_POWER_LEVEL: u8 = 0x0A;
pub const ADV_TYPE_APPEARANCE: u8 = 0x19;
pub const ADV_TYPE_MANUFACTURER_SPECIFIC: u8 = 0xFF;
