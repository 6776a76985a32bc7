//! ATT protocol constants

// Fixed L2CAP channel carrying ATT
pub const ATT_CID: u16 = 0x0004;

// MTU bounds for this implementation
pub const ATT_DEFAULT_MTU: u16 = 23;
pub const ATT_MAX_MTU: u16 = 517;

// Handle range
pub const ATT_HANDLE_MIN: u16 = 0x0001;
pub const ATT_HANDLE_MAX: u16 = 0xFFFF;

// Longest attribute value the server stores or the client reassembles
pub const ATT_MAX_VALUE_LEN: usize = 512;

// Prepared-write queue bound
pub const ATT_PREPARE_QUEUE_SIZE: usize = 128;

// Request/indication timeout (Core spec: transaction timeout)
pub const ATT_TRANSACTION_TIMEOUT_SECS: u64 = 30;

// ATT opcodes (responses are request + 1)
pub const ATT_ERROR_RSP: u8 = 0x01;
pub const ATT_EXCHANGE_MTU_REQ: u8 = 0x02;
pub const ATT_EXCHANGE_MTU_RSP: u8 = 0x03;
pub const ATT_FIND_INFO_REQ: u8 = 0x04;
pub const ATT_FIND_INFO_RSP: u8 = 0x05;
pub const ATT_FIND_BY_TYPE_VALUE_REQ: u8 = 0x06;
pub const ATT_FIND_BY_TYPE_VALUE_RSP: u8 = 0x07;
pub const ATT_READ_BY_TYPE_REQ: u8 = 0x08;
pub const ATT_READ_BY_TYPE_RSP: u8 = 0x09;
pub const ATT_READ_REQ: u8 = 0x0A;
pub const ATT_READ_RSP: u8 = 0x0B;
pub const ATT_READ_BLOB_REQ: u8 = 0x0C;
pub const ATT_READ_BLOB_RSP: u8 = 0x0D;
pub const ATT_READ_MULTIPLE_REQ: u8 = 0x0E;
pub const ATT_READ_MULTIPLE_RSP: u8 = 0x0F;
pub const ATT_READ_BY_GROUP_TYPE_REQ: u8 = 0x10;
pub const ATT_READ_BY_GROUP_TYPE_RSP: u8 = 0x11;
pub const ATT_WRITE_REQ: u8 = 0x12;
pub const ATT_WRITE_RSP: u8 = 0x13;
pub const ATT_PREPARE_WRITE_REQ: u8 = 0x16;
pub const ATT_PREPARE_WRITE_RSP: u8 = 0x17;
pub const ATT_EXECUTE_WRITE_REQ: u8 = 0x18;
pub const ATT_EXECUTE_WRITE_RSP: u8 = 0x19;
pub const ATT_HANDLE_VALUE_NTF: u8 = 0x1B;
pub const ATT_HANDLE_VALUE_IND: u8 = 0x1D;
pub const ATT_HANDLE_VALUE_CONF: u8 = 0x1E;
pub const ATT_WRITE_CMD: u8 = 0x52;
pub const ATT_SIGNED_WRITE_CMD: u8 = 0xD2;

// Find Information response formats
pub const ATT_FIND_INFO_FORMAT_16BIT: u8 = 0x01;
pub const ATT_FIND_INFO_FORMAT_128BIT: u8 = 0x02;

// Execute Write flags
pub const ATT_EXEC_WRITE_CANCEL: u8 = 0x00;
pub const ATT_EXEC_WRITE_COMMIT: u8 = 0x01;

// Declaration and descriptor UUIDs the engine interprets
pub const PRIMARY_SERVICE_UUID: u16 = 0x2800;
pub const SECONDARY_SERVICE_UUID: u16 = 0x2801;
pub const INCLUDE_UUID: u16 = 0x2802;
pub const CHARACTERISTIC_UUID: u16 = 0x2803;
pub const EXTENDED_PROPERTIES_UUID: u16 = 0x2900;
pub const CLIENT_CHAR_CONFIG_UUID: u16 = 0x2902;

// Mandatory services and characteristics
pub const GENERIC_ACCESS_SERVICE_UUID: u16 = 0x1800;
pub const GENERIC_ATTRIBUTE_SERVICE_UUID: u16 = 0x1801;
pub const DEVICE_NAME_UUID: u16 = 0x2A00;
pub const APPEARANCE_UUID: u16 = 0x2A01;
pub const SERVICE_CHANGED_UUID: u16 = 0x2A05;
