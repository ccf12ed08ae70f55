#![cfg(target_os = "android")]

//! Entry points for `hev.sockstun.TProxyService`

use jni::objects::{JClass, JString};
use jni::sys::{jint, jlong, jlongArray};
use jni::JNIEnv;
use parking_lot::Mutex;
use std::ffi::CString;
use std::thread::JoinHandle;

extern "C" {
    fn __android_log_write(prio: i32, tag: *const libc::c_char, text: *const libc::c_char) -> i32;
}

const ANDROID_LOG_INFO: i32 = 4;
const ANDROID_LOG_ERROR: i32 = 6;

/// Thread executing the engine between start and stop
static RUNNER: Mutex<Option<JoinHandle<()>>> = Mutex::new(None);

/// Logcat output for failures that can happen before tracing is set up
fn android_log(prio: i32, message: &str) {
    if let (Ok(tag), Ok(text)) = (CString::new("sockstun"), CString::new(message)) {
        unsafe {
            __android_log_write(prio, tag.as_ptr(), text.as_ptr());
        }
    }
}

#[no_mangle]
pub extern "system" fn Java_hev_sockstun_TProxyService_TProxyStartService<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
    config_path: JString<'local>,
    fd: jint,
) {
    let path: String = match env.get_string(&config_path) {
        Ok(path) => path.into(),
        Err(e) => {
            android_log(ANDROID_LOG_ERROR, &format!("invalid config path: {}", e));
            return;
        }
    };

    if let Err(e) = crate::init(fd, &path) {
        android_log(ANDROID_LOG_ERROR, &format!("init failed: {}", e));
        return;
    }

    let spawned = std::thread::Builder::new()
        .name("sockstun".into())
        .spawn(|| {
            if let Err(e) = crate::run() {
                tracing::error!("tunnel exited with error: {}", e);
            }
        });

    match spawned {
        Ok(handle) => {
            *RUNNER.lock() = Some(handle);
            android_log(ANDROID_LOG_INFO, "tunnel started");
        }
        Err(e) => {
            android_log(ANDROID_LOG_ERROR, &format!("cannot spawn tunnel thread: {}", e));
            let _ = crate::fini();
        }
    }
}

#[no_mangle]
pub extern "system" fn Java_hev_sockstun_TProxyService_TProxyStopService<'local>(
    _env: JNIEnv<'local>,
    _class: JClass<'local>,
) {
    if let Err(e) = crate::stop() {
        tracing::warn!("stop: {}", e);
        return;
    }
    if let Some(handle) = RUNNER.lock().take() {
        if handle.join().is_err() {
            tracing::error!("tunnel thread panicked");
        }
    }
    if let Err(e) = crate::fini() {
        tracing::error!("fini: {}", e);
    }
    android_log(ANDROID_LOG_INFO, "tunnel stopped");
}

/// Returns `long[4]`: tx packets, tx bytes, rx packets, rx bytes
#[no_mangle]
pub extern "system" fn Java_hev_sockstun_TProxyService_TProxyGetStats<'local>(
    mut env: JNIEnv<'local>,
    _class: JClass<'local>,
) -> jlongArray {
    let values: Vec<jlong> = crate::stats()
        .unwrap_or_default()
        .to_array()
        .iter()
        .map(|&v| v as jlong)
        .collect();

    let array = match env.new_long_array(values.len() as i32) {
        Ok(array) => array,
        Err(e) => {
            tracing::error!("cannot allocate stats array: {}", e);
            return std::ptr::null_mut();
        }
    };
    if let Err(e) = env.set_long_array_region(&array, 0, &values) {
        tracing::error!("cannot fill stats array: {}", e);
        return std::ptr::null_mut();
    }
    array.into_raw()
}
