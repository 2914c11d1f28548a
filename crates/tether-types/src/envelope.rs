//! Completion envelope codec.
//!
//! A task's state travels as a single opaque byte string: keyed,
//! self-describing JSON of [`TaskRecord`]. The same encoding is used for the
//! stored record and for the notification published on the completion
//! channel, so a late subscriber can resolve from either. The keyed form is
//! what keeps the format stable across producer and consumer binaries of the
//! same release.

use crate::error::{ErrorKind, TaskError};
use crate::task::TaskRecord;

/// Serialize a record to its wire form.
pub fn encode(record: &TaskRecord) -> Result<Vec<u8>, TaskError> {
    serde_json::to_vec(record).map_err(|err| {
        TaskError::serialization(format!("encode task record: {err}"))
            .with_origin(record.task_id.to_string())
    })
}

/// Deserialize a record without checking the response type.
///
/// Used by the worker side, which updates whatever record it finds and does
/// not hold an expectation about the payload type.
pub fn decode_record(bytes: &[u8]) -> Result<TaskRecord, TaskError> {
    serde_json::from_slice(bytes)
        .map_err(|err| TaskError::serialization(format!("decode task record: {err}")))
}

/// Deserialize a record and verify it carries the expected response type.
///
/// A mismatch means producer and consumer disagree about the payload and the
/// bytes must not be handed to the caller's deserializer.
pub fn decode(bytes: &[u8], expected_type: &str) -> Result<TaskRecord, TaskError> {
    let record = decode_record(bytes)?;
    if record.response_type != expected_type {
        return Err(TaskError::serialization(format!(
            "response type mismatch: expected `{expected_type}`, envelope carries `{}`",
            record.response_type
        ))
        .with_origin(record.task_id.to_string()));
    }
    Ok(record)
}

/// Resolve a terminal record into the waiter's outcome: the payload on
/// `Completed`, the recorded error on `Failed`.
///
/// A non-terminal record here means the notification protocol was violated
/// (published before the terminal write) and surfaces as an internal error.
pub fn into_payload(record: TaskRecord) -> Result<Vec<u8>, TaskError> {
    match (record.status, record.result, record.error) {
        (crate::task::TaskStatus::Completed, Some(payload), _) => Ok(payload),
        (crate::task::TaskStatus::Completed, None, _) => Err(TaskError::new(
            ErrorKind::CoordinatorInternal,
            "completed record without a result payload",
        )),
        (crate::task::TaskStatus::Failed, _, Some(error)) => Err(error),
        (crate::task::TaskStatus::Failed, _, None) => Err(TaskError::new(
            ErrorKind::CoordinatorInternal,
            "failed record without a recorded error",
        )),
        (crate::task::TaskStatus::Pending, _, _) => Err(TaskError::new(
            ErrorKind::CoordinatorInternal,
            "envelope resolved before a terminal transition",
        )),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use similar_asserts::assert_eq;

    use crate::error::ErrorKind;
    use crate::task::{TaskId, TaskStatus};

    use super::*;

    fn pending(response_type: &str) -> TaskRecord {
        TaskRecord::pending(TaskId::generate(), response_type)
    }

    #[test]
    fn success_round_trip() {
        let mut record = pending("i64");
        record.complete(b"42".to_vec(), Utc::now());

        let bytes = encode(&record).unwrap();
        let back = decode(&bytes, "i64").unwrap();
        assert_eq!(back, record);
        assert_eq!(into_payload(back).unwrap(), b"42".to_vec());
    }

    #[test]
    fn failure_round_trip_preserves_kind_message_origin() {
        let mut record = pending("i64");
        record.fail(
            TaskError::new(ErrorKind::HandlerFailed, "handler blew up").with_origin("attempt 3"),
            Utc::now(),
        );

        let bytes = encode(&record).unwrap();
        let back = decode(&bytes, "i64").unwrap();
        let err = into_payload(back).unwrap_err();
        assert_eq!(err.kind, ErrorKind::HandlerFailed);
        assert_eq!(err.message, "handler blew up");
        assert_eq!(err.origin.as_deref(), Some("attempt 3"));
    }

    #[test]
    fn empty_payload_is_distinct_from_absent() {
        let mut record = pending("()");
        record.complete(Vec::new(), Utc::now());

        let bytes = encode(&record).unwrap();
        let back = decode_record(&bytes).unwrap();
        assert_eq!(back.result, Some(Vec::new()));
        assert_eq!(into_payload(back).unwrap(), Vec::<u8>::new());

        // A pending record carries no result key at all.
        let bytes = encode(&pending("()")).unwrap();
        let json = std::str::from_utf8(&bytes).unwrap();
        assert!(!json.contains("\"result\""));
    }

    #[test]
    fn response_type_mismatch_is_a_serialization_failure() {
        let mut record = pending("i64");
        record.complete(b"42".to_vec(), Utc::now());
        let bytes = encode(&record).unwrap();

        let err = decode(&bytes, "alloc::string::String").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SerializationFailed);
        assert!(err.message.contains("i64"));
    }

    #[test]
    fn malformed_bytes_fail_to_decode() {
        let err = decode_record(b"{not json").unwrap_err();
        assert_eq!(err.kind, ErrorKind::SerializationFailed);
    }

    #[test]
    fn pending_envelope_does_not_resolve() {
        let record = pending("i64");
        assert_eq!(record.status, TaskStatus::Pending);
        let err = into_payload(record).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CoordinatorInternal);
    }
}
