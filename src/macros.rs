//! Convenience macros wrapping the client handle API.

/// Registers (once) and bumps a counter in one expression.
///
/// With a value the counter is increased by it, without one it is increased
/// by 1. Registration is get-or-register, so calling this in a loop sends a
/// single descriptor on the wire.
///
/// # Examples
///
/// ```no_run
/// use tau_metric_proxy::{count, MetricProxyClient};
///
/// let client = MetricProxyClient::from_env();
/// count!(client, "requests_total", "Total requests served");
/// count!(client, "bytes_sent_total", "Bytes sent", 1024.0);
/// ```
#[macro_export]
macro_rules! count {
    ($client:expr, $name:expr, $doc:expr) => {
        $client.counter($name, $doc).incr()
    };
    ($client:expr, $name:expr, $doc:expr, $value:expr) => {
        $client.counter($name, $doc).add($value)
    };
}

/// Registers (once) and sets a gauge in one expression.
///
/// # Examples
///
/// ```no_run
/// use tau_metric_proxy::{gauge, MetricProxyClient};
///
/// let client = MetricProxyClient::from_env();
/// gauge!(client, "queue_depth", "Entries waiting", 17.0);
/// ```
#[macro_export]
macro_rules! gauge {
    ($client:expr, $name:expr, $doc:expr, $value:expr) => {
        $client.gauge($name, $doc).set($value)
    };
}
