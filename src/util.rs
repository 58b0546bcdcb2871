//! Small OS helpers shared by the proxy and the client library.

use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock timestamp in seconds, as carried in metric events.
#[must_use]
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |d| d.as_secs_f64())
}

/// Wall-clock time in whole seconds, as carried in job descriptors.
#[must_use]
pub fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Real user id of this process.
#[must_use]
pub fn uid() -> u32 {
    // SAFETY: getuid has no failure mode and touches no memory.
    unsafe { libc::getuid() }
}

/// Pid of this process.
#[must_use]
pub fn pid() -> u32 {
    // SAFETY: getpid has no failure mode and touches no memory.
    let pid = unsafe { libc::getpid() };
    u32::try_from(pid).unwrap_or(0)
}

/// Hostname of this node, or `"unknown"` when the kernel refuses to say.
#[must_use]
pub fn hostname() -> String {
    let mut buf = [0_u8; 256];
    // SAFETY: the buffer is valid for the length we pass; gethostname
    // NUL-terminates within it on success.
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
    if rc != 0 {
        return "unknown".to_string();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// DJB2 over the name bytes; bucket index is `hash % bucket count`.
#[must_use]
pub fn string_hash(s: &str) -> u64 {
    s.bytes()
        .fold(5381_u64, |hash, c| hash.wrapping_mul(33).wrapping_add(u64::from(c)))
}
