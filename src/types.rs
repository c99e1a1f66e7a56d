use serde::{Deserialize, Serialize};
use time::{macros::format_description, OffsetDateTime};

/// Upstream SOCKS5 proxy every credential is checked against.
pub const PROXY_HOST: &str = "120.233.207.183";
pub const PROXY_PORT: u16 = 10093;
/// IP-echo service requested through the proxy.
pub const TARGET_URL: &str = "ipinfo.io";

/// Marker embedded in every persisted report file name.
pub const RESULT_MARKER: &str = "_result_";

pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 500;
pub const DEFAULT_CONCURRENCY: usize = 50;

/// One input row: a proxy account and its password, identified by its position in the input.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub sequence_index: usize,
    pub account: String,
    pub secret: String,
}

impl Credential {
    pub fn new(
        sequence_index: usize,
        account: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        Self {
            sequence_index,
            account: account.into().trim().to_string(),
            secret: secret.into().trim().to_string(),
        }
    }

    /// Rows with an empty account or password never reach the transport.
    pub fn is_valid(&self) -> bool {
        !self.account.is_empty() && !self.secret.is_empty()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    Success,
    Failure,
}

impl ProbeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Metrics of a probe that made it through the proxy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SuccessDetail {
    pub ip: String,
    pub http_code: String,
    pub response_time_secs: f64,
    pub download_speed_kbps: f64,
    pub total_time_secs: f64,
}

/// Result of probing a single credential. Every layer below the scheduler reports through this.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Success(SuccessDetail),
    Failure(String),
}

impl Verdict {
    pub fn failure(note: impl Into<String>) -> Self {
        Self::Failure(note.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Final, immutable record for one credential as it appears in the report.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub sequence_index: usize,
    pub timestamp: String,
    pub account: String,
    pub secret: String,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub resolved_ip: Option<String>,
    pub status: ProbeStatus,
    pub response_time_secs: Option<f64>,
    pub download_speed_kbps: Option<f64>,
    pub total_time_secs: Option<f64>,
    pub note: String,
}

impl ProbeOutcome {
    pub fn from_verdict(credential: &Credential, verdict: Verdict) -> Self {
        let mut outcome = Self {
            sequence_index: credential.sequence_index,
            timestamp: now_local_timestamp(),
            account: credential.account.clone(),
            secret: credential.secret.clone(),
            proxy_host: PROXY_HOST.to_string(),
            proxy_port: PROXY_PORT,
            resolved_ip: None,
            status: ProbeStatus::Failure,
            response_time_secs: None,
            download_speed_kbps: None,
            total_time_secs: None,
            note: String::new(),
        };
        match verdict {
            Verdict::Success(detail) => {
                outcome.note = success_note(&detail);
                outcome.status = ProbeStatus::Success;
                outcome.resolved_ip = Some(detail.ip);
                outcome.response_time_secs = Some(detail.response_time_secs);
                outcome.download_speed_kbps = Some(detail.download_speed_kbps);
                outcome.total_time_secs = Some(detail.total_time_secs);
            }
            Verdict::Failure(note) => outcome.note = note,
        }
        outcome
    }

    pub fn is_success(&self) -> bool {
        self.status == ProbeStatus::Success
    }

    /// Short line for the run log.
    pub fn log_line(&self) -> String {
        format!("[{}] {}: {}", self.sequence_index + 1, self.account, self.note)
    }
}

pub fn format_secs(secs: f64) -> String {
    format!("{secs:.2}s")
}

pub fn format_kbps(kbps: f64) -> String {
    format!("{kbps:.2}KB/s")
}

fn success_note(detail: &SuccessDetail) -> String {
    format!(
        "success - proxy ip: {}, response time: {}, download speed: {}",
        detail.ip,
        format_secs(detail.response_time_secs),
        format_kbps(detail.download_speed_kbps)
    )
}

/// Local wall-clock time, falling back to UTC when the local offset cannot be determined.
pub(crate) fn now_local() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

pub(crate) fn now_local_timestamp() -> String {
    now_local()
        .format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .unwrap_or_else(|_| String::from("1970-01-01 00:00:00"))
}

pub(crate) fn now_local_clock() -> String {
    now_local()
        .format(format_description!("[hour]:[minute]:[second]"))
        .unwrap_or_else(|_| String::from("00:00:00"))
}
