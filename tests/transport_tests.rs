#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use proxy_audit::transport::{
    probe_credential, CurlOptions, CurlTransport, ProbeTransport, TransportError,
};
use proxy_audit::types::{Credential, Verdict};

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn transport(program: PathBuf, supervise: Duration) -> CurlTransport {
    CurlTransport::new(CurlOptions {
        program,
        supervise_timeout: supervise,
        ..CurlOptions::default()
    })
}

// All scripts are written before any is executed; exec of a file another thread still
// holds open for writing fails with ETXTBSY.
#[tokio::test]
async fn fake_curl_scenarios() {
    let dir = tempfile::tempdir().unwrap();
    let ok = script(
        dir.path(),
        "ok.sh",
        r#"case "$1" in --version) exit 0;; esac
printf '{"ip": "8.8.4.4"}\n200,0.321,4096'"#,
    );
    let refused = script(
        dir.path(),
        "refused.sh",
        "echo 'curl: (97) proxy handshake failed' >&2\nexit 97",
    );
    let hung = script(dir.path(), "hung.sh", "sleep 30");
    let cred = Credential::new(0, "alice", "secret");

    let t = transport(ok.clone(), Duration::from_secs(10));
    t.preflight().await.unwrap();
    match probe_credential(&t, &cred).await {
        Verdict::Success(d) => {
            assert_eq!(d.ip, "8.8.4.4");
            assert_eq!(d.http_code, "200");
            assert!((d.response_time_secs - 0.321).abs() < 1e-9);
            assert!((d.download_speed_kbps - 4.0).abs() < 1e-9);
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(t.live_count(), 0);

    let t = transport(refused, Duration::from_secs(10));
    match probe_credential(&t, &cred).await {
        Verdict::Failure(note) => {
            assert!(note.starts_with("proxy connection failed"), "note: {note}");
            assert!(note.contains("(97)"), "note: {note}");
        }
        other => panic!("expected failure, got {other:?}"),
    }

    let t = transport(hung.clone(), Duration::from_millis(300));
    let started = Instant::now();
    let err = t.probe(&cred).await.unwrap_err();
    assert!(matches!(err, TransportError::Timeout(_)));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(t.live_count(), 0, "timed-out probe group is released");

    let t = transport(hung, Duration::from_secs(30));
    let pending = {
        let t = t.clone();
        let cred = cred.clone();
        tokio::spawn(async move { t.probe(&cred).await })
    };
    let spawned = tokio::time::timeout(Duration::from_secs(5), async {
        while t.live_count() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(spawned.is_ok(), "probe process never started");
    let started = Instant::now();
    t.terminate_all();
    let raw = pending.await.unwrap().unwrap();
    assert_eq!(raw.exit_code, None, "terminated by signal");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(t.live_count(), 0);

    let missing = transport(dir.path().join("no-such-curl"), Duration::from_secs(1));
    assert!(matches!(
        missing.preflight().await,
        Err(TransportError::Unavailable(_))
    ));
    assert!(matches!(
        missing.probe(&cred).await,
        Err(TransportError::Spawn { .. })
    ));
}
