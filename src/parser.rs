use serde_json::Value;

use crate::transport::RawProbe;
use crate::types::{SuccessDetail, Verdict};

/// Interpret the captured output of one probe.
///
/// Expected stdout is the JSON body of the IP-echo service immediately followed by the
/// `http_code,time_total,speed_download` line curl prints for `-w`. Any deviation
/// (non-zero exit, blank output, bad JSON, no `ip`, unparseable stats) is a failure
/// carrying curl's stderr. Never panics.
pub fn parse_probe(raw: &RawProbe) -> Verdict {
    if raw.exit_code == Some(0) {
        if let Some(detail) = parse_success(&raw.stdout, raw.elapsed.as_secs_f64()) {
            return Verdict::Success(detail);
        }
    }
    Verdict::failure(failure_note(&raw.stderr))
}

fn parse_success(stdout: &str, total_time_secs: f64) -> Option<SuccessDetail> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return None;
    }
    let (body, stats) = split_body_and_stats(trimmed)?;

    let json: Value = serde_json::from_str(body).ok()?;
    let ip = json.get("ip")?.as_str()?.trim();
    if ip.is_empty() {
        return None;
    }

    let mut fields = stats.split(',').map(str::trim);
    let http_code = fields.next()?.to_string();
    let time_total: f64 = fields.next()?.parse().ok()?;
    let speed_download: f64 = fields.next()?.parse().ok()?;
    if !time_total.is_finite() || !speed_download.is_finite() {
        return None;
    }

    Some(SuccessDetail {
        ip: ip.to_string(),
        http_code,
        response_time_secs: time_total,
        download_speed_kbps: speed_download / 1024.0,
        total_time_secs,
    })
}

/// The stats line is whatever follows the closing brace of the body. curl does not add a
/// newline before it, so splitting on lines alone is not enough.
fn split_body_and_stats(s: &str) -> Option<(&str, &str)> {
    let close = s.rfind('}')?;
    let (body, rest) = s.split_at(close + 1);
    let stats = rest.trim();
    if stats.is_empty() {
        return None;
    }
    Some((body.trim(), stats))
}

fn failure_note(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        "proxy connection failed: unknown error".to_string()
    } else {
        format!("proxy connection failed: {stderr}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn raw(exit: Option<i32>, stdout: &str, stderr: &str) -> RawProbe {
        RawProbe {
            exit_code: exit,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            elapsed: Duration::from_millis(1234),
        }
    }

    #[test]
    fn parses_body_with_trailing_newline_before_stats() {
        let out = "{\n  \"ip\": \"1.2.3.4\",\n  \"city\": \"X\"\n}\n200,0.532,2048\n";
        match parse_probe(&raw(Some(0), out, "")) {
            Verdict::Success(d) => {
                assert_eq!(d.ip, "1.2.3.4");
                assert_eq!(d.http_code, "200");
                assert!((d.response_time_secs - 0.532).abs() < 1e-9);
                assert!((d.download_speed_kbps - 2.0).abs() < 1e-9);
                assert!((d.total_time_secs - 1.234).abs() < 1e-9);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn parses_stats_glued_to_body() {
        let out = "{\"ip\":\"5.6.7.8\"}200,1.0,512";
        assert!(parse_probe(&raw(Some(0), out, "")).is_success());
    }

    #[test]
    fn missing_ip_is_failure() {
        let out = "{\"city\":\"X\"}\n200,1.0,512";
        assert_eq!(
            parse_probe(&raw(Some(0), out, "")),
            Verdict::failure("proxy connection failed: unknown error")
        );
    }

    #[test]
    fn non_zero_exit_reports_stderr() {
        let out = "{\"ip\":\"5.6.7.8\"}\n200,1.0,512";
        let stderr = "curl: (97) User was rejected by the SOCKS5 server\n";
        assert_eq!(
            parse_probe(&raw(Some(97), out, stderr)),
            Verdict::failure(format!("proxy connection failed: {}", stderr.trim()))
        );
    }

    #[test]
    fn garbage_never_panics() {
        let inputs = [
            "",
            "   ",
            "}",
            "{",
            "not json}1,2,3",
            "{\"ip\":1}\n200,1,1",
            "{\"ip\":\"a\"}\n200,x,1",
            "{\"ip\":\"a\"}\n200",
        ];
        for out in inputs {
            assert!(!parse_probe(&raw(Some(0), out, "")).is_success(), "input: {out:?}");
        }
        assert!(!parse_probe(&raw(None, "{\"ip\":\"a\"}\n200,1,1", "")).is_success());
    }
}
