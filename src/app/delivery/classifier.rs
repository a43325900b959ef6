use super::{DeliveryError, DeliveryResponse};

/// What the worker does with a finished delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Sent {
        status_code: u16,
        body: Option<String>,
    },
    /// Worth retrying: the provider or the path to it hiccuped.
    Transient {
        status_code: Option<u16>,
        reason: String,
    },
    /// Retrying cannot help: the request itself is unacceptable.
    Permanent {
        status_code: Option<u16>,
        reason: String,
    },
}

impl Outcome {
    pub fn is_transient(&self) -> bool {
        matches!(self, Outcome::Transient { .. })
    }
}

/// Status codes that indicate a temporary condition. 408/429 are the two
/// retriable 4xx; 521/522/524 are CDN-layer timeouts.
const TRANSIENT_STATUS: [u16; 9] = [408, 429, 500, 502, 503, 504, 521, 522, 524];

/// Maps a delivery attempt to its outcome class. Transport errors and
/// breaker fail-fasts are transient by definition; HTTP statuses follow
/// the table: 2xx sent, 408/429/5xx transient, remaining 4xx permanent.
pub fn classify(result: Result<DeliveryResponse, DeliveryError>) -> Outcome {
    match result {
        Ok(response) if response.success => Outcome::Sent {
            status_code: response.status_code,
            body: response.body,
        },
        Ok(response) => {
            let code = response.status_code;
            if TRANSIENT_STATUS.contains(&code) || (500..600).contains(&code) {
                Outcome::Transient {
                    status_code: Some(code),
                    reason: format!("provider returned {code}"),
                }
            } else {
                Outcome::Permanent {
                    status_code: Some(code),
                    reason: format!("provider rejected with {code}"),
                }
            }
        }
        Err(e) => Outcome::Transient {
            status_code: None,
            reason: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status_code: u16) -> Result<DeliveryResponse, DeliveryError> {
        Ok(DeliveryResponse {
            success: (200..300).contains(&status_code),
            status_code,
            body: None,
        })
    }

    #[test]
    fn two_hundreds_are_sent() {
        assert!(matches!(classify(response(200)), Outcome::Sent { .. }));
        assert!(matches!(classify(response(202)), Outcome::Sent { .. }));
    }

    #[test]
    fn retriable_statuses_are_transient() {
        for code in [408, 429, 500, 502, 503, 504, 521, 522, 524] {
            assert!(classify(response(code)).is_transient(), "{code}");
        }
    }

    #[test]
    fn other_client_errors_are_permanent() {
        for code in [400, 401, 403, 404, 410, 422] {
            assert!(
                matches!(classify(response(code)), Outcome::Permanent { .. }),
                "{code}"
            );
        }
    }

    #[test]
    fn transport_errors_are_transient() {
        assert!(classify(Err(DeliveryError::Timeout)).is_transient());
        assert!(classify(Err(DeliveryError::Transport("reset".into()))).is_transient());
        assert!(classify(Err(DeliveryError::BreakerOpen)).is_transient());
    }
}
