//! Values pushed to the supervisor over Zenoh.
//!
//! Setpoints arrive on `<prefix>/<tcw>/@/setpoint` and irrigation demand on
//! `<prefix>/<poseidon>/@/demand`, JSON or CBOR. Each accepted value replaces
//! the content of a `watch` channel read by the pollers at the start of
//! their next cycle.

use serre_common::serialization::decode_auto;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use zenoh::Session;
use zenoh::sample::SampleKind;

use crate::regulation::Setpoint;

/// Decode a setpoint payload, e.g. `{"temperature": 21.0, "humidite": 60}`.
pub fn parse_setpoint(payload: &[u8]) -> serre_common::Result<Setpoint> {
    decode_auto(payload)
}

/// Decode an irrigation demand payload: a bare `true`/`false` or
/// `{"demand": true}`.
pub fn parse_demand(payload: &[u8]) -> serre_common::Result<bool> {
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum Demand {
        Bare(bool),
        Wrapped { demand: bool },
    }

    decode_auto::<Demand>(payload).map(|d| match d {
        Demand::Bare(on) | Demand::Wrapped { demand: on } => on,
    })
}

/// Forward every valid sample on `key_expr` into `tx` until the session closes
/// or every receiver is gone.
pub async fn listen<T>(
    session: &Session,
    key_expr: &str,
    tx: watch::Sender<T>,
    parse: fn(&[u8]) -> serre_common::Result<T>,
) -> serre_common::Result<()>
where
    T: PartialEq + std::fmt::Debug + Send + Sync,
{
    let subscriber = session.declare_subscriber(key_expr).await?;
    info!(key_expr = %key_expr, "Listening for inputs");

    loop {
        let sample = match subscriber.recv_async().await {
            Ok(sample) => sample,
            Err(e) => {
                debug!(key_expr = %key_expr, error = %e, "Input subscriber closed");
                break;
            }
        };

        if sample.kind() == SampleKind::Delete {
            continue;
        }

        let payload = sample.payload().to_bytes();
        match parse(&payload) {
            Ok(value) => {
                info!(key = %sample.key_expr(), value = ?value, "Input received");
                tx.send_if_modified(|current| {
                    if *current == value {
                        false
                    } else {
                        *current = value;
                        true
                    }
                });
                if tx.is_closed() {
                    break;
                }
            }
            Err(e) => {
                warn!(key = %sample.key_expr(), error = %e, "Ignoring invalid input");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serre_common::serialization::{Format, encode};

    #[test]
    fn test_parse_setpoint_json() {
        let setpoint = parse_setpoint(br#"{"temperature": 21.0, "humidite": 60}"#).unwrap();
        assert_eq!(setpoint, Setpoint::new(Some(21.0), Some(60.0)));

        let setpoint = parse_setpoint(br#"{"humidity": 55.5}"#).unwrap();
        assert_eq!(setpoint, Setpoint::new(None, Some(55.5)));
    }

    #[test]
    fn test_parse_setpoint_cbor() {
        let bytes = encode(&Setpoint::new(Some(19.0), None), Format::Cbor).unwrap();
        assert_eq!(parse_setpoint(&bytes).unwrap(), Setpoint::new(Some(19.0), None));
    }

    #[test]
    fn test_parse_setpoint_rejects_garbage() {
        assert!(parse_setpoint(b"not a setpoint").is_err());
        assert!(parse_setpoint(br#"{"temperature": "warm"}"#).is_err());
    }

    #[test]
    fn test_parse_demand() {
        assert!(parse_demand(b"true").unwrap());
        assert!(!parse_demand(b" false").unwrap());
        assert!(parse_demand(br#"{"demand": true}"#).unwrap());
        assert!(parse_demand(b"1").is_err());
        assert!(parse_demand(b"").is_err());
    }
}
