//! An office run that overstays its deadline is torn down together with
//! every helper it forked, and its working area is removed.

#![cfg(unix)]

mod common;

use common::{config, leftovers};
use docrelay::engines::LibreOfficeEngine;
use docrelay::{
    BackendHealthRegistry, BackendKind, Backends, CapabilityTable, ConversionEngine,
    ConversionRequest, FailureKind, Format,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn timed_out_office_run_leaves_no_helpers_behind() {
    let root = tempfile::tempdir().unwrap();
    let scripts = tempfile::tempdir().unwrap();
    let marker = scripts.path().join("helper-finished");
    let script = scripts.path().join("soffice.sh");
    // A helper outlives the launcher unless the whole group is killed.
    std::fs::write(
        &script,
        format!("sh -c 'sleep 1; touch \"{}\"' &\nwait\n", marker.display()),
    )
    .unwrap();

    let mut config = config(root.path());
    config.office_enabled = true;
    config.office_timeout = Duration::from_millis(200);
    let office = LibreOfficeEngine::new().with_command("/bin/sh", vec![script.display().to_string()]);
    let backends = Backends::from_config(&config).with(Arc::new(office));
    let engine = ConversionEngine::with_parts(
        CapabilityTable::from_config(&config),
        backends,
        Arc::new(BackendHealthRegistry::new()),
        config,
    );

    let request = ConversionRequest::new(&b"PK\x03\x04"[..], Format::Docx, Format::Pdf);
    let started = Instant::now();
    let err = engine.convert(&request).await.unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(err.attempts[0].backend, BackendKind::Office);
    assert_eq!(err.attempts[0].failure, Some(FailureKind::Timeout));
    assert_eq!(leftovers(root.path()), 0);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!marker.exists(), "a forked office helper survived the timeout");
}
