//! Load-balancing instrumentation hooks (Design Notes §9: "`startTime` /
//! `stopTime` on the LB component for the associated element id"), and
//! the NDJSON persistence format for `vt_lb_data` (6).
//!
//! The load balancer itself — strategies, migration decisions — is a
//! user of the core (1, non-goals); what belongs here is the timing hook
//! every `Runnable` fires through, plus the data file shape the real LB
//! subsystem would read back via `OfflineLB`.

use serde_derive::{Deserialize, Serialize};

#[cfg(feature = "lb")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "lb")]
use std::time::Instant;

#[cfg(feature = "lb")]
static ELEMENT_TIME_NANOS: AtomicU64 = AtomicU64::new(0);

#[cfg(feature = "lb")]
pub type LbTimer = Instant;
#[cfg(not(feature = "lb"))]
pub type LbTimer = ();

#[cfg(feature = "lb")]
#[inline]
pub fn start_time() -> LbTimer {
    Instant::now()
}

#[cfg(feature = "lb")]
#[inline]
pub fn stop_time(_element_id: u64, started: LbTimer) {
    let elapsed = started.elapsed().as_nanos() as u64;
    ELEMENT_TIME_NANOS.fetch_add(elapsed, Ordering::Relaxed);
}

#[cfg(not(feature = "lb"))]
#[inline]
pub fn start_time() -> LbTimer {}

#[cfg(not(feature = "lb"))]
#[inline]
pub fn stop_time(_element_id: u64, _started: LbTimer) {}

/// One `vt_lb_data` NDJSON record (6): `{"phases":[...],"metadata":{...}}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct LbDatafile {
    pub phases: Vec<LbPhase>,
    pub metadata: LbMetadata,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LbMetadata {
    #[serde(rename = "type")]
    pub kind: String,
}

impl Default for LbMetadata {
    fn default() -> LbMetadata {
        LbMetadata {
            kind: "LBDatafile".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbPhase {
    pub id: u64,
    pub tasks: Vec<LbTask>,
    pub communications: Vec<LbCommunication>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbTask {
    pub entity: u64,
    pub time: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbCommunication {
    pub from: u64,
    pub to: u64,
    pub bytes: u64,
}

/// Writes one newline-delimited JSON record per phase to `writer`,
/// matching the `{dir}/{file}` stream format in (6).
pub fn write_ndjson<W: std::io::Write>(
    writer: &mut W,
    phases: &[LbPhase],
) -> std::io::Result<()> {
    for phase in phases {
        let record = LbDatafile {
            phases: vec![phase.clone()],
            metadata: LbMetadata::default(),
        };
        serde_json::to_writer(&mut *writer, &record)?;
        writer.write_all(b"\n")?;
    }
    Ok(())
}

/// Expands the `%p` rank placeholder in `vt_lb_data_file`-style path
/// templates (6).
pub fn expand_rank_template(template: &str, rank: crate::node::NodeT) -> String {
    template.replace("%p", &rank.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_rank_placeholder() {
        assert_eq!(expand_rank_template("lb.%p.json", 3), "lb.3.json");
    }

    #[test]
    fn ndjson_roundtrips_one_line_per_phase() {
        let phases = vec![
            LbPhase { id: 0, tasks: vec![], communications: vec![] },
            LbPhase { id: 1, tasks: vec![], communications: vec![] },
        ];
        let mut buf = Vec::new();
        write_ndjson(&mut buf, &phases).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 2);
        for line in text.lines() {
            let parsed: LbDatafile = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.metadata.kind, "LBDatafile");
        }
    }
}
