use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::Validation(format!(
            "interval start {} must be before end {}",
            span.start, span.end
        )));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

pub(crate) fn validate_window(window: &Span) -> Result<(), EngineError> {
    if window.start >= window.end {
        return Err(EngineError::Validation(
            "query window start must be before end".into(),
        ));
    }
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

pub(crate) fn validate_text(
    value: &str,
    field: &'static str,
    max: usize,
) -> Result<(), EngineError> {
    if value.len() > max {
        return Err(EngineError::Validation(format!(
            "{field} is {} bytes, max {max}",
            value.len()
        )));
    }
    Ok(())
}

impl Engine {
    /// Turn raw overlapping allocations into the conflict read model by
    /// joining in the opposing booking rows. Takes each opposing booking's
    /// read lock: lock order is booking before resource, so callers must
    /// not hold any resource guard here.
    pub(super) async fn conflict_entries(&self, hits: &[Allocation]) -> Vec<ConflictEntry> {
        let mut entries = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(handle) = self.booking_handle(hit.booking_id) else {
                continue;
            };
            let booking = handle.read().await;
            entries.push(ConflictEntry {
                booking_id: booking.id,
                client_name: booking.client_name.clone(),
                span: hit.span,
                status: booking.status,
            });
        }
        entries
    }

    /// Build the full conflict error from overlapping allocations found
    /// under a resource guard. The guard must already be dropped.
    pub(super) async fn conflict_error(
        &self,
        resource_id: ulid::Ulid,
        hits: &[Allocation],
    ) -> EngineError {
        metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
        let conflicts = self.conflict_entries(hits).await;
        EngineError::Conflict {
            resource_id,
            conflicts,
        }
    }
}
