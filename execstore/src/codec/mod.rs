//! Record codec.
//!
//! An [`ExecutionRecord`] is stored as one flat hash of string fields:
//!
//! | field                 | value                                   |
//! |-----------------------|-----------------------------------------|
//! | `id`                  | record id                               |
//! | `type`                | `PIPELINE` / `ORCHESTRATION`            |
//! | `application`         | owning application                      |
//! | `status`              | status name                             |
//! | `buildTime`           | epoch millis                            |
//! | `startTime`           | epoch millis, absent if unset           |
//! | `endTime`             | epoch millis, absent if unset           |
//! | `canceled`            | `true` / `false`                        |
//! | `cancellationReason`  | absent if unset                         |
//! | `context`             | JSON object                             |
//! | `stageIndex`          | comma-separated stage ids, in order     |
//! | `version`             | optimistic concurrency counter          |
//! | `stage.{id}.{field}`  | `name`, `status`, `startTime`, `endTime`, `context` |
//!
//! Decoding never substitutes defaults for bad data: any missing required
//! field or unparsable value is reported as `StoreError::CorruptRecord`.

use crate::backend::VERSION_FIELD;
use crate::core::{ContextMap, ExecutionRecord, ExecutionStatus, ExecutionType, StageRecord};
use crate::errors::{Result, StoreError};
use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

/// Hash field names.
pub mod fields {
    /// Record id.
    pub const ID: &str = "id";
    /// Execution type.
    pub const TYPE: &str = "type";
    /// Owning application.
    pub const APPLICATION: &str = "application";
    /// Status.
    pub const STATUS: &str = "status";
    /// Build time.
    pub const BUILD_TIME: &str = "buildTime";
    /// Start time.
    pub const START_TIME: &str = "startTime";
    /// End time.
    pub const END_TIME: &str = "endTime";
    /// Cancellation flag.
    pub const CANCELED: &str = "canceled";
    /// Cancellation reason.
    pub const CANCELLATION_REASON: &str = "cancellationReason";
    /// JSON context.
    pub const CONTEXT: &str = "context";
    /// Ordered stage ids.
    pub const STAGE_INDEX: &str = "stageIndex";
    /// Stage name.
    pub const NAME: &str = "name";
}

/// Flat field map written to the backend.
pub type FieldMap = BTreeMap<String, String>;

/// Converts records to and from the backend's hash representation.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordCodec;

fn stage_field(stage_id: &str, field: &str) -> String {
    format!("stage.{stage_id}.{field}")
}

impl RecordCodec {
    /// Creates a codec.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Encodes a record into hash fields.
    pub fn encode(&self, record: &ExecutionRecord) -> Result<FieldMap> {
        let mut out = FieldMap::new();
        out.insert(fields::ID.into(), record.id.clone());
        out.insert(fields::TYPE.into(), record.execution_type.to_string());
        out.insert(fields::APPLICATION.into(), record.application.clone());
        out.insert(fields::STATUS.into(), record.status.to_string());
        out.insert(fields::BUILD_TIME.into(), record.build_time.to_string());
        if let Some(start) = record.start_time {
            out.insert(fields::START_TIME.into(), start.to_string());
        }
        if let Some(end) = record.end_time {
            out.insert(fields::END_TIME.into(), end.to_string());
        }
        out.insert(fields::CANCELED.into(), record.canceled.to_string());
        if let Some(reason) = &record.cancellation_reason {
            out.insert(fields::CANCELLATION_REASON.into(), reason.clone());
        }
        out.insert(
            fields::CONTEXT.into(),
            encode_context(&record.id, &record.context)?,
        );
        out.insert(VERSION_FIELD.into(), record.version.to_string());

        let stage_ids: Vec<&str> = record.stages.iter().map(|s| s.id.as_str()).collect();
        out.insert(fields::STAGE_INDEX.into(), stage_ids.join(","));
        for stage in &record.stages {
            out.insert(stage_field(&stage.id, fields::NAME), stage.name.clone());
            out.insert(stage_field(&stage.id, fields::STATUS), stage.status.to_string());
            if let Some(start) = stage.start_time {
                out.insert(stage_field(&stage.id, fields::START_TIME), start.to_string());
            }
            if let Some(end) = stage.end_time {
                out.insert(stage_field(&stage.id, fields::END_TIME), end.to_string());
            }
            out.insert(
                stage_field(&stage.id, fields::CONTEXT),
                encode_context(&record.id, &stage.context)?,
            );
        }
        Ok(out)
    }

    /// Decodes hash fields read from `key`.
    ///
    /// An empty map means the key does not exist; callers check that first.
    pub fn decode(&self, key: &str, hash: &HashMap<String, String>) -> Result<ExecutionRecord> {
        let reader = FieldReader { key, hash };

        let stage_index = reader.required(fields::STAGE_INDEX)?;
        let mut stages = Vec::new();
        for stage_id in stage_index.split(',').filter(|s| !s.is_empty()) {
            stages.push(reader.stage(stage_id)?);
        }

        Ok(ExecutionRecord {
            id: reader.required(fields::ID)?.to_string(),
            execution_type: reader.parsed(fields::TYPE)?,
            application: reader.required(fields::APPLICATION)?.to_string(),
            status: reader.parsed(fields::STATUS)?,
            build_time: reader.parsed(fields::BUILD_TIME)?,
            start_time: reader.optional_parsed(fields::START_TIME)?,
            end_time: reader.optional_parsed(fields::END_TIME)?,
            canceled: reader.parsed(fields::CANCELED)?,
            cancellation_reason: hash.get(fields::CANCELLATION_REASON).cloned(),
            context: reader.context(fields::CONTEXT)?,
            stages,
            version: reader.parsed(VERSION_FIELD)?,
        })
    }

    /// Reads only the fields needed to locate a record's index entries.
    pub fn decode_identity(
        &self,
        key: &str,
        hash: &HashMap<String, String>,
    ) -> Result<(ExecutionType, String)> {
        let reader = FieldReader { key, hash };
        Ok((
            reader.parsed(fields::TYPE)?,
            reader.required(fields::APPLICATION)?.to_string(),
        ))
    }
}

fn encode_context(id: &str, context: &ContextMap) -> Result<String> {
    serde_json::to_string(context)
        .map_err(|e| StoreError::invalid_record(id, format!("context is not serializable: {e}")))
}

struct FieldReader<'a> {
    key: &'a str,
    hash: &'a HashMap<String, String>,
}

impl FieldReader<'_> {
    fn corrupt(&self, reason: String) -> StoreError {
        StoreError::corrupt(self.key, reason)
    }

    fn required(&self, field: &str) -> Result<&str> {
        self.hash
            .get(field)
            .map(String::as_str)
            .ok_or_else(|| self.corrupt(format!("missing field '{field}'")))
    }

    fn parse<T>(&self, field: &str, raw: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        raw.parse()
            .map_err(|e| self.corrupt(format!("field '{field}' has invalid value '{raw}': {e}")))
    }

    fn parsed<T>(&self, field: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.parse(field, self.required(field)?)
    }

    fn optional_parsed<T>(&self, field: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.hash
            .get(field)
            .map(|raw| self.parse(field, raw))
            .transpose()
    }

    fn context(&self, field: &str) -> Result<ContextMap> {
        let raw = self.required(field)?;
        serde_json::from_str(raw)
            .map_err(|e| self.corrupt(format!("field '{field}' is not a JSON object: {e}")))
    }

    fn stage(&self, stage_id: &str) -> Result<StageRecord> {
        let name_field = stage_field(stage_id, fields::NAME);
        if !self.hash.contains_key(&name_field) {
            return Err(self.corrupt(format!("stage '{stage_id}' is indexed but has no fields")));
        }
        Ok(StageRecord {
            id: stage_id.to_string(),
            name: self.required(&name_field)?.to_string(),
            status: self.parsed::<ExecutionStatus>(&stage_field(stage_id, fields::STATUS))?,
            start_time: self.optional_parsed(&stage_field(stage_id, fields::START_TIME))?,
            end_time: self.optional_parsed(&stage_field(stage_id, fields::END_TIME))?,
            context: self.context(&stage_field(stage_id, fields::CONTEXT))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    const KEY: &str = "execution:run-1";

    fn sample() -> ExecutionRecord {
        ExecutionRecord::new("run-1", "app-a")
            .with_build_time(1_700_000_000_000)
            .with_status(ExecutionStatus::Running)
            .with_context("trigger", json!({"type": "manual", "user": null}))
            .with_stage(
                StageRecord::new("bake")
                    .with_status(ExecutionStatus::Succeeded)
                    .with_start_time(1)
                    .with_end_time(2),
            )
            .with_stage(StageRecord::new("deploy").with_context("region", json!("eu")))
    }

    fn as_hash(fields: FieldMap) -> HashMap<String, String> {
        fields.into_iter().collect()
    }

    #[test]
    fn test_round_trip() {
        let codec = RecordCodec::new();
        let record = sample();
        let decoded = codec.decode(KEY, &as_hash(codec.encode(&record).unwrap())).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_absent_optionals_are_absent_fields() {
        let encoded = RecordCodec.encode(&sample()).unwrap();
        assert!(!encoded.contains_key(fields::START_TIME));
        assert!(!encoded.contains_key(fields::CANCELLATION_REASON));
        assert!(!encoded.contains_key("stage.deploy.startTime"));
        assert_eq!(encoded.get(fields::STAGE_INDEX).unwrap(), "bake,deploy");
    }

    #[test]
    fn test_null_context_value_survives() {
        let encoded = RecordCodec.encode(&sample()).unwrap();
        let decoded = RecordCodec.decode(KEY, &as_hash(encoded)).unwrap();
        assert_eq!(decoded.context["trigger"]["user"], serde_json::Value::Null);
    }

    #[test]
    fn test_missing_required_field_is_corrupt() {
        let mut hash = as_hash(RecordCodec.encode(&sample()).unwrap());
        hash.remove(fields::STATUS);
        let err = RecordCodec.decode(KEY, &hash).unwrap_err();
        assert!(matches!(err, StoreError::CorruptRecord { ref key, .. } if key == KEY));
    }

    #[test]
    fn test_bad_values_are_corrupt() {
        let base = as_hash(RecordCodec.encode(&sample()).unwrap());

        for (field, value) in [
            (fields::STATUS, "SLEEPING"),
            (fields::BUILD_TIME, "yesterday"),
            (fields::CONTEXT, "[1, 2"),
            (VERSION_FIELD, "-1"),
        ] {
            let mut hash = base.clone();
            hash.insert(field.to_string(), value.to_string());
            let err = RecordCodec.decode(KEY, &hash).unwrap_err();
            assert_eq!(err.kind(), crate::errors::ErrorKind::CorruptRecord, "{field}");
        }
    }

    #[test]
    fn test_indexed_stage_without_fields_is_corrupt() {
        let mut hash = as_hash(RecordCodec.encode(&sample()).unwrap());
        hash.insert(fields::STAGE_INDEX.to_string(), "bake,deploy,verify".to_string());
        let err = RecordCodec.decode(KEY, &hash).unwrap_err();
        assert!(err.to_string().contains("verify"));
    }

    #[test]
    fn test_decode_identity() {
        let hash = as_hash(RecordCodec.encode(&sample()).unwrap());
        let (kind, app) = RecordCodec.decode_identity(KEY, &hash).unwrap();
        assert_eq!(kind, ExecutionType::Pipeline);
        assert_eq!(app, "app-a");
    }

    fn json_scalar() -> impl Strategy<Value = serde_json::Value> {
        prop_oneof![
            Just(serde_json::Value::Null),
            any::<bool>().prop_map(serde_json::Value::from),
            any::<i64>().prop_map(serde_json::Value::from),
            "[a-z0-9 ]{0,12}".prop_map(serde_json::Value::from),
        ]
    }

    fn context() -> impl Strategy<Value = ContextMap> {
        prop::collection::btree_map("[a-z]{1,8}", json_scalar(), 0..4)
    }

    fn status() -> impl Strategy<Value = ExecutionStatus> {
        prop::sample::select(ExecutionStatus::ALL.to_vec())
    }

    fn stage() -> impl Strategy<Value = StageRecord> {
        (
            "[a-z]{1,10}",
            status(),
            prop::option::of(0i64..i64::MAX),
            prop::option::of(0i64..i64::MAX),
            context(),
        )
            .prop_map(|(name, status, start, end, context)| StageRecord {
                id: name.clone(),
                name,
                status,
                start_time: start,
                end_time: end,
                context,
            })
    }

    fn record() -> impl Strategy<Value = ExecutionRecord> {
        (
            "[a-z0-9-]{1,16}",
            "[a-z]{1,10}",
            prop::sample::select(ExecutionType::ALL.to_vec()),
            status(),
            any::<i64>(),
            prop::option::of(any::<i64>()),
            prop::option::of("[a-z ]{0,20}"),
            context(),
            prop::collection::vec(stage(), 0..5),
            any::<u64>(),
        )
            .prop_map(
                |(id, app, kind, status, build, end, reason, context, stages, version)| {
                    let mut seen = std::collections::HashSet::new();
                    let stages = stages
                        .into_iter()
                        .filter(|s| seen.insert(s.id.clone()))
                        .collect();
                    ExecutionRecord {
                        id,
                        execution_type: kind,
                        application: app,
                        status,
                        build_time: build,
                        start_time: Some(build),
                        end_time: end,
                        canceled: reason.is_some(),
                        cancellation_reason: reason,
                        context,
                        stages,
                        version,
                    }
                },
            )
    }

    proptest! {
        #[test]
        fn prop_round_trip(record in record()) {
            let codec = RecordCodec::new();
            let encoded = codec.encode(&record).unwrap();
            let decoded = codec.decode("execution:prop", &as_hash(encoded)).unwrap();
            prop_assert_eq!(decoded, record);
        }
    }
}
