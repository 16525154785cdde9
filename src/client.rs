//! Blocking HTTP client for the feeder's REST API.
//!
//! - Blocking client using `ureq` (no async); the event loop in `crate::runtime` is
//!   the only caller.
//! - Uses the wire models in `crate::models::feeder`.
//! - Non-2xx responses are surfaced as [`FeederClientError::Http`]; anything that
//!   never produced a response is [`FeederClientError::Transport`].

use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::models::feeder::*;

#[derive(Debug)]
pub enum FeederClientError {
    /// No response reached us (offline, DNS, timeout, reset).
    Transport(String),
    /// The device answered with an error status.
    Http { status: u16, message: String },
    Json(serde_json::Error),
    /// A response body did not match the expected model.
    Decode { path: String, source: serde_json::Error },
}

impl FeederClientError {
    pub fn is_transport(&self) -> bool {
        matches!(self, FeederClientError::Transport(_))
    }
}

impl core::fmt::Display for FeederClientError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FeederClientError::Transport(s) => write!(f, "transport error: {}", s),
            FeederClientError::Http { status, message } => write!(f, "http {}: {}", status, message),
            FeederClientError::Json(e) => write!(f, "json error: {}", e),
            FeederClientError::Decode { path, source } => write!(f, "decode error at {}: {}", path, source),
        }
    }
}

impl std::error::Error for FeederClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FeederClientError::Json(e) => Some(e),
            FeederClientError::Decode { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for FeederClientError {
    fn from(value: serde_json::Error) -> Self {
        FeederClientError::Json(value)
    }
}

/// Remote operations the synchronization core depends on.
pub trait FeederApi {
    fn get_status(&self) -> Result<MachineStatus, FeederClientError>;
    fn get_schedules(&self) -> Result<Vec<Schedule>, FeederClientError>;
    /// Persist a new schedule; returns the assigned ID.
    fn create_schedule(&self, schedule: &Schedule) -> Result<ScheduleId, FeederClientError>;
    fn update_schedule(&self, schedule: &Schedule) -> Result<(), FeederClientError>;
    fn delete_schedule(&self, id: ScheduleId) -> Result<(), FeederClientError>;
    fn activate_schedule(&self, id: ScheduleId, active: bool) -> Result<(), FeederClientError>;
    fn get_settings(&self) -> Result<Settings, FeederClientError>;
    fn update_settings(&self, settings: &Settings) -> Result<(), FeederClientError>;
    fn open_food(&self) -> Result<(), FeederClientError>;
    fn close_food(&self) -> Result<(), FeederClientError>;
}

pub struct FeederClient {
    agent: ureq::Agent,
    base_url: String,
}

impl FeederClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        FeederClient {
            agent: config.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn read_body(resp: Result<http::Response<ureq::Body>, ureq::Error>) -> Result<String, FeederClientError> {
        match resp {
            Ok(mut res) => {
                let status = res.status();
                let body = res
                    .body_mut()
                    .read_to_string()
                    .map_err(|e| FeederClientError::Transport(e.to_string()))?;
                if status.is_success() {
                    Ok(body)
                } else {
                    Err(FeederClientError::Http {
                        status: status.as_u16(),
                        message: if body.is_empty() { String::from("<no body>") } else { body },
                    })
                }
            }
            Err(ureq::Error::StatusCode(status)) => Err(FeederClientError::Http {
                status,
                message: String::from("<no body>"),
            }),
            Err(e) => Err(FeederClientError::Transport(e.to_string())),
        }
    }

    fn decode<T: DeserializeOwned>(body: &str) -> Result<T, FeederClientError> {
        let de = &mut serde_json::Deserializer::from_str(body);
        serde_path_to_error::deserialize(de).map_err(|e| FeederClientError::Decode {
            path: e.path().to_string(),
            source: e.into_inner(),
        })
    }

    fn get_text(&self, path: &str, query: &[(&str, String)]) -> Result<String, FeederClientError> {
        let mut req = self.agent.get(&self.url(path)).header("Accept", "application/json");
        for (k, v) in query {
            req = req.query(*k, v);
        }
        Self::read_body(req.call())
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, FeederClientError> {
        let body = self.get_text(path, query)?;
        Self::decode(&body)
    }
}

impl FeederApi for FeederClient {
    fn get_status(&self) -> Result<MachineStatus, FeederClientError> {
        self.get_json("/status", &[])
    }

    fn get_schedules(&self) -> Result<Vec<Schedule>, FeederClientError> {
        let list: ScheduleList = self.get_json("/schedule", &[])?;
        Ok(list.schedules)
    }

    fn create_schedule(&self, schedule: &Schedule) -> Result<ScheduleId, FeederClientError> {
        let resp = self
            .agent
            .post(&self.url("/schedule"))
            .header("Accept", "application/json")
            .send_json(schedule);
        let body = Self::read_body(resp)?;
        Self::decode(body.trim())
    }

    fn update_schedule(&self, schedule: &Schedule) -> Result<(), FeederClientError> {
        let resp = self
            .agent
            .put(&self.url("/schedule"))
            .header("Accept", "application/json")
            .send_json(schedule);
        Self::read_body(resp).map(|_| ())
    }

    fn delete_schedule(&self, id: ScheduleId) -> Result<(), FeederClientError> {
        let resp = self
            .agent
            .delete(&self.url("/schedule"))
            .query("id", id.0.to_string())
            .call();
        Self::read_body(resp).map(|_| ())
    }

    fn activate_schedule(&self, id: ScheduleId, active: bool) -> Result<(), FeederClientError> {
        let query = [("id", id.0.to_string()), ("active", active.to_string())];
        self.get_text("/schedule/activate", &query).map(|_| ())
    }

    fn get_settings(&self) -> Result<Settings, FeederClientError> {
        self.get_json("/settings", &[])
    }

    fn update_settings(&self, settings: &Settings) -> Result<(), FeederClientError> {
        let resp = self
            .agent
            .put(&self.url("/settings"))
            .header("Accept", "application/json")
            .send_json(settings);
        Self::read_body(resp).map(|_| ())
    }

    fn open_food(&self) -> Result<(), FeederClientError> {
        self.get_text("/food/open", &[]).map(|_| ())
    }

    fn close_food(&self) -> Result<(), FeederClientError> {
        self.get_text("/food/close", &[]).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_paths_onto_base_url() {
        let client = FeederClient::new("http://tigerbox.local/api/", Duration::from_secs(1));
        assert_eq!(client.base_url(), "http://tigerbox.local/api");
        assert_eq!(client.url("/status"), "http://tigerbox.local/api/status");
        assert_eq!(client.url("settings"), "http://tigerbox.local/api/settings");
    }

    #[test]
    fn decode_errors_carry_the_json_path() {
        let body = r#"{"schedules":[{"ID":1,"Mode":"weekly"}]}"#;
        match FeederClient::decode::<ScheduleList>(body) {
            Err(FeederClientError::Decode { path, .. }) => assert_eq!(path, "schedules[0].Mode"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn decodes_bare_id_response() {
        let id: ScheduleId = FeederClient::decode("7").expect("id");
        assert_eq!(id, ScheduleId(7));
    }

    #[test]
    fn unreachable_device_is_a_transport_error() {
        // port 9 (discard) on localhost is closed in test environments
        let client = FeederClient::new("http://127.0.0.1:9", Duration::from_millis(500));
        let err = client.get_status().expect_err("no device");
        assert!(err.is_transport(), "{}", err);
    }
}
