// Address types
pub const PUBLIC_DEVICE_ADDRESS: u8 = 0x00;
pub const RANDOM_DEVICE_ADDRESS: u8 = 0x01;
pub const PUBLIC_IDENTITY_ADDRESS: u8 = 0x02;
pub const RANDOM_IDENTITY_ADDRESS: u8 = 0x03;

// Advertising Data Types
pub const ADV_TYPE_FLAGS: u8 = 0x01;
pub const ADV_TYPE_SHORT_LOCAL_NAME: u8 = 0x08;
pub const ADV_TYPE_COMPLETE_LOCAL_NAME: u8 = 0x09;
pub const ADV_TYPE_MANUFACTURER_SPECIFIC: u8 = 0xFF;

// Random address sub-type markers held in the two most significant bits
pub const RANDOM_ADDR_TYPE_MASK: u8 = 0xC0;
pub const RANDOM_ADDR_NRPA: u8 = 0x00;
pub const RANDOM_ADDR_RPA: u8 = 0x40;
pub const RANDOM_ADDR_STATIC: u8 = 0xC0;
