//! Per-job persistence: dumps on disconnect, consolidation into profiles.

use super::common::{wait_for, TestProxy};
use tau_metric_proxy::proxy::dump::MetricDump;
use tau_metric_proxy::proxy::profile;

fn profile_counter(proxy: &TestProxy, jobid: &str, metric: &str) -> Option<f64> {
    let path = proxy.profiles.profile_path(jobid).unwrap();
    if !path.is_file() {
        return None;
    }
    let dump = MetricDump::load(&path).ok()?;
    dump.snapshots
        .iter()
        .find(|s| s.event.name == metric)
        .map(|s| s.event.value)
}

#[test]
fn last_disconnect_dumps_and_consolidator_builds_the_profile() {
    let proxy = TestProxy::start();

    let client = proxy.client("J1", "./app");
    let requests = client.counter("requests_total", "Total requests");
    requests.add(5.0);
    requests.add(3.0);
    client.shutdown();

    // The release callback runs when the server notices the disconnect.
    wait_for("job entry released", || proxy.state.jobs.is_empty());
    wait_for("dump folded into profile", || {
        proxy.consolidate();
        profile_counter(&proxy, "J1", "requests_total") == Some(8.0)
    });
}

#[test]
fn two_processes_of_one_job_merge_into_one_profile() {
    let proxy = TestProxy::start();

    let a = proxy.client("J2", "./rank0");
    let b = proxy.client("J2", "./rank0");
    a.counter("req", "requests").add(4.0);
    b.counter("req", "requests").add(6.0);

    a.shutdown();
    b.shutdown();
    wait_for("both contributors released", || proxy.state.jobs.is_empty());

    wait_for("merged profile", || {
        proxy.consolidate();
        profile_counter(&proxy, "J2", "req") == Some(10.0)
    });
}

#[test]
fn successive_invocations_accumulate_into_the_profile() {
    let proxy = TestProxy::start();

    for (value, expected) in [(4.0, 4.0), (6.0, 10.0)] {
        let client = proxy.client("J3", "./step");
        client.counter("req", "requests").add(value);
        client.shutdown();
        wait_for("job released", || proxy.state.jobs.is_empty());
        wait_for("dump consumed", || {
            proxy.consolidate();
            profile_counter(&proxy, "J3", "req") == Some(expected)
        });
    }

    assert_eq!(profile_counter(&proxy, "J3", "req"), Some(10.0));
}

#[test]
fn consolidation_consumes_each_dump_exactly_once() {
    let proxy = TestProxy::start();

    let client = proxy.client("J4", "./app");
    client.counter("req", "requests").add(7.0);
    client.shutdown();
    wait_for("job released", || proxy.state.jobs.is_empty());

    wait_for("dump folded", || {
        proxy.consolidate();
        profile_counter(&proxy, "J4", "req") == Some(7.0)
    });

    // Re-running the sweep finds nothing new and must not double-count.
    assert_eq!(proxy.consolidate(), 0);
    assert_eq!(profile_counter(&proxy, "J4", "req"), Some(7.0));
}

#[test]
fn second_aggregator_on_the_same_directory_is_refused() {
    let proxy = TestProxy::start();

    // The resident leader holds a fresh lock...
    profile::check_lock(proxy.dir.path()).unwrap();
    // ...which a peer with a different identity must respect.
    std::fs::write(proxy.dir.path().join("lock"), "peerhost:12345\n").unwrap();
    assert!(profile::check_lock(proxy.dir.path()).is_err());
}
