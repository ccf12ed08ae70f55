//! C ABI and JNI surface for the sockstun tunnel engine
//!
//! Holds one process-wide [`Tunnel`]. The platform calls `init` with a tun
//! descriptor and a configuration file, `run` on a thread it dedicates to the
//! engine, `stop` from anywhere, then `fini` once `run` has returned.

use libc::{c_char, c_int};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use sockstun_tunnel::{init_logging, Config, TrafficStats, Tunnel, TunnelError};
use std::ffi::CStr;
use std::sync::Arc;
use tracing::info;

mod error;

#[cfg(target_os = "android")]
pub mod android_jni;

pub use error::*;

/// Global tunnel instance
static TUNNEL: Lazy<Mutex<Option<Arc<Tunnel>>>> = Lazy::new(|| Mutex::new(None));

fn current() -> Result<Arc<Tunnel>, TunnelError> {
    TUNNEL
        .lock()
        .clone()
        .ok_or(TunnelError::OrderingViolation("no tunnel initialized"))
}

/// Load the configuration at `config_path` and set up the tunnel on `fd`.
pub fn init(fd: c_int, config_path: &str) -> Result<(), TunnelError> {
    let mut slot = TUNNEL.lock();
    if slot.is_some() {
        return Err(TunnelError::OrderingViolation("init while a tunnel exists"));
    }
    let config = Config::from_file(config_path)?;
    init_logging(&config.misc)?;
    let tunnel = Tunnel::init(fd, config)?;
    *slot = Some(Arc::new(tunnel));
    Ok(())
}

/// Block until [`stop`] is called.
pub fn run() -> Result<(), TunnelError> {
    current()?.run()
}

pub fn stop() -> Result<(), TunnelError> {
    current()?.stop()
}

/// Release the tunnel. Fails while `run` is still executing.
pub fn fini() -> Result<(), TunnelError> {
    let mut slot = TUNNEL.lock();
    let tunnel = slot
        .as_ref()
        .ok_or(TunnelError::OrderingViolation("fini before init"))?;
    tunnel.fini()?;
    *slot = None;
    info!("tunnel released");
    Ok(())
}

pub fn stats() -> Result<TrafficStats, TunnelError> {
    Ok(current()?.stats())
}

/// # Safety
///
/// `config_path` must be null or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn sockstun_init(fd: c_int, config_path: *const c_char) -> c_int {
    if config_path.is_null() {
        return SOCKSTUN_ERR_CONFIG;
    }
    let path = match CStr::from_ptr(config_path).to_str() {
        Ok(path) => path,
        Err(_) => return SOCKSTUN_ERR_CONFIG,
    };
    report(init(fd, path), "sockstun_init")
}

#[no_mangle]
pub extern "C" fn sockstun_run() -> c_int {
    report(run(), "sockstun_run")
}

#[no_mangle]
pub extern "C" fn sockstun_stop() -> c_int {
    report(stop(), "sockstun_stop")
}

#[no_mangle]
pub extern "C" fn sockstun_fini() -> c_int {
    report(fini(), "sockstun_fini")
}

/// # Safety
///
/// Each pointer must be null or valid for writing one `u64`.
#[no_mangle]
pub unsafe extern "C" fn sockstun_stats(
    tx_packets: *mut u64,
    tx_bytes: *mut u64,
    rx_packets: *mut u64,
    rx_bytes: *mut u64,
) -> c_int {
    let (traffic, code) = match stats() {
        Ok(traffic) => (traffic, SOCKSTUN_OK),
        Err(e) => (TrafficStats::default(), error_code(&e)),
    };
    for (ptr, value) in [tx_packets, tx_bytes, rx_packets, rx_bytes]
        .into_iter()
        .zip(traffic.to_array())
    {
        if !ptr.is_null() {
            *ptr = value;
        }
    }
    code
}
