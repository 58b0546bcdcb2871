//! Exposition format as seen by a scraper.

use super::common::{wait_for, TestProxy};

#[test]
fn labelled_series_share_one_header_block() {
    let proxy = TestProxy::start();

    let client = proxy.client("", "");
    client
        .counter("http_requests_total{code=\"200\"}", "Requests by code")
        .add(12.0);
    client
        .counter("http_requests_total{code=\"500\"}", "Requests by code")
        .add(2.0);
    client.shutdown();

    wait_for("values ingested", || {
        proxy
            .state
            .main
            .get("http_requests_total{code=\"500\"}")
            .is_some_and(|m| m.cell().value.scalar() == 2.0)
    });

    let text = proxy.metrics_text();
    assert_eq!(text.matches("# HELP http_requests_total ").count(), 1);
    assert_eq!(text.matches("# TYPE http_requests_total counter").count(), 1);
    assert!(text.contains("http_requests_total{code=\"200\"} 12\n"));
    assert!(text.contains("http_requests_total{code=\"500\"} 2\n"));
}

#[test]
fn unaffiliated_clients_still_export() {
    let proxy = TestProxy::start();

    // Empty jobid: no per-job store, but the node-wide view works.
    let client = proxy.client("", "");
    client.gauge("load", "Node load").set(2.5);
    client.shutdown();

    wait_for("gauge ingested", || {
        proxy.state.main.get("load").is_some()
    });
    assert!(proxy.state.jobs.is_empty());
    assert!(proxy.metrics_text().contains("# TYPE load gauge"));
}
