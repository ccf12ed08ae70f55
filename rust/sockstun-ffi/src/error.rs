use libc::c_int;
use sockstun_tunnel::TunnelError;

/// Return codes of the C ABI
pub const SOCKSTUN_OK: c_int = 0;
pub const SOCKSTUN_ERR_CONFIG: c_int = -1;
pub const SOCKSTUN_ERR_DESCRIPTOR: c_int = -2;
pub const SOCKSTUN_ERR_ORDERING: c_int = -3;
pub const SOCKSTUN_ERR_IO: c_int = -4;
pub const SOCKSTUN_ERR_INTERNAL: c_int = -5;

pub fn error_code(err: &TunnelError) -> c_int {
    match err {
        TunnelError::Configuration(_) => SOCKSTUN_ERR_CONFIG,
        TunnelError::InvalidDescriptor(_) => SOCKSTUN_ERR_DESCRIPTOR,
        TunnelError::OrderingViolation(_) => SOCKSTUN_ERR_ORDERING,
        TunnelError::Io(_) => SOCKSTUN_ERR_IO,
        _ => SOCKSTUN_ERR_INTERNAL,
    }
}

/// Log a failure and turn it into a return code
pub fn report(result: Result<(), TunnelError>, what: &str) -> c_int {
    match result {
        Ok(()) => SOCKSTUN_OK,
        Err(e) => {
            tracing::error!("{} failed: {}", what, e);
            error_code(&e)
        }
    }
}
