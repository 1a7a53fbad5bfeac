/// DNS-SD service type enumeration meta-type.
/// Instances found under it are themselves service types.
pub const SERVICES_DOMAIN: &str = "_services._dns-sd._udp";

/// Default browse domain
pub const LOCAL_DOMAIN: &str = "local.";

/// Domain reported for enumerated service types
pub const EMPTY_DOMAIN: &str = ".";

pub const TCP_REG_TYPE_SUFFIX: &str = "_tcp";
pub const UDP_REG_TYPE_SUFFIX: &str = "_udp";
pub const REG_TYPE_SEPARATOR: char = '.';

/// Backend flag: more events are queued behind this one
pub const FLAG_MORE_COMING: u32 = 0x1;
/// Backend flag: the record was added (found) rather than removed
pub const FLAG_ADD: u32 = 0x2;

/// API path prefix
pub const API_PREFIX: &str = "/v1";
