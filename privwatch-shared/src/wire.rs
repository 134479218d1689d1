//! Ingest wire format.
//!
//! The forwarder POSTs a JSON array of [`AlertWire`] objects to the
//! collector's `/api/alerts/ingest` endpoint. Only public alert fields are
//! projected; lifecycle flags (acknowledged, forwarded) stay local.

use serde::{Deserialize, Serialize};

/// One alert as shipped to the remote collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertWire {
    pub alert_id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: String,
    pub confidence: f64,
    pub description: String,
    pub pid: u32,
    pub ppid: u32,
    pub uid: u32,
    pub new_uid: u32,
    pub comm: String,
    pub parent_comm: String,
    pub syscall: String,
    pub filename: String,
    pub timestamp: i64,
}

/// Collector response to an ingest POST.
///
/// The collector deduplicates on `alert_id`, so `inserted` may be smaller
/// than the batch size when a batch is replayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub inserted: u64,
    pub success: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip_preserves_identity() {
        let wire = AlertWire {
            alert_id: "6f2c9a30-1111-4222-8333-444455556666".to_string(),
            rule_id: "RULE-01".to_string(),
            rule_name: "Direct UID to Root".to_string(),
            severity: "CRITICAL".to_string(),
            confidence: 0.99,
            description: "UID 1000 -> root via setuid (PID 42, myapp)".to_string(),
            pid: 42,
            ppid: 1,
            uid: 1000,
            new_uid: 0,
            comm: "myapp".to_string(),
            parent_comm: "bash".to_string(),
            syscall: "setuid".to_string(),
            filename: String::new(),
            timestamp: 123456789,
        };

        let json = serde_json::to_string(&wire).unwrap();
        let back: AlertWire = serde_json::from_str(&json).unwrap();
        assert_eq!(back.alert_id, wire.alert_id);
        assert_eq!(back.uid, 1000);
        assert_eq!(back.new_uid, 0);
    }

    #[test]
    fn test_ingest_response_parses_collector_body() {
        let body = r#"{"inserted": 50, "success": true}"#;
        let resp: IngestResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.inserted, 50);
        assert!(resp.success);
    }
}
