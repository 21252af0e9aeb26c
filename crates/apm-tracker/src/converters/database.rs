// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{LayerConverter, RequestView};
use crate::db_query::{DbQueryMetricSet, DbQueryMetricStats};
use crate::errors::ConvertError;
use crate::layer::LayerNode;
use serde_json::Value;

/// Layer annotation holding the number of rows a query returned.
pub const RECORD_COUNT_ANNOTATION: &str = "record_count";

const DATABASE_LAYER_TYPE: &str = "ActiveRecord";
const DEFAULT_MODEL: &str = "SQL";
const DEFAULT_OPERATION: &str = "other";

/// Per model and operation query statistics of a request.
pub struct DatabaseConverter<'a> {
    view: RequestView<'a>,
    scoped: bool,
    queries: DbQueryMetricSet,
}

impl<'a> DatabaseConverter<'a> {
    #[must_use]
    pub fn new(view: RequestView<'a>) -> Self {
        Self {
            view,
            scoped: view.scope_layer().is_some(),
            queries: DbQueryMetricSet::new(),
        }
    }
}

/// `"User/find"` is model `User`, operation `find`.
fn split_name(name: &str) -> (&str, &str) {
    let mut parts = name.split('/');
    let model = parts
        .next()
        .filter(|model| !model.is_empty())
        .unwrap_or(DEFAULT_MODEL);
    let operation = parts
        .next()
        .filter(|operation| !operation.is_empty())
        .unwrap_or(DEFAULT_OPERATION);
    (model, operation)
}

fn rows_returned(value: Option<&Value>) -> Result<u64, ConvertError> {
    match value {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(number)) => {
            number
                .as_u64()
                .ok_or_else(|| ConvertError::MalformedAnnotation {
                    key: RECORD_COUNT_ANNOTATION.to_string(),
                    reason: format!("{number} is not a row count"),
                })
        }
        Some(other) => Err(ConvertError::MalformedAnnotation {
            key: RECORD_COUNT_ANNOTATION.to_string(),
            reason: format!("expected a number, got {other}"),
        }),
    }
}

impl<'a> LayerConverter<'a> for DatabaseConverter<'a> {
    fn name(&self) -> &'static str {
        "database"
    }

    fn visit(&mut self, layer: LayerNode<'a>) -> Result<(), ConvertError> {
        if !self.scoped {
            return Ok(());
        }
        let Some(layer) = layer.as_layer() else {
            return Ok(());
        };
        if layer.layer_type().as_str() != DATABASE_LAYER_TYPE || layer.is_ignorable() {
            return Ok(());
        }

        let name = layer.name().as_str();
        let (model, operation) = split_name(&name);
        let rows = rows_returned(layer.annotations().get(RECORD_COUNT_ANNOTATION))?;
        self.queries.insert(DbQueryMetricStats::new(
            model,
            operation,
            1,
            layer.total_call_time().as_secs_f64(),
            rows,
        ));
        Ok(())
    }

    fn record(self: Box<Self>) -> Result<(), ConvertError> {
        if self.queries.is_empty() {
            return Ok(());
        }
        self.view.agent.store().track_db_query_metrics(self.queries);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::layer::{Annotations, Layer};
    use crate::test_support::{agent_with, run, stopped};
    use crate::tracked_request::{RequestType, TrackedRequest};
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn query(name: &str, start: Instant, millis: u64, rows: Value) -> Layer {
        let mut layer = stopped("ActiveRecord", name, start, millis);
        let mut values = Annotations::new();
        values.insert(RECORD_COUNT_ANNOTATION.to_string(), rows);
        layer.annotate(values);
        layer
    }

    #[test]
    fn test_queries_grouped_by_model_and_operation() {
        let (agent, store) = agent_with(AgentConfig::default());
        let start = Instant::now();
        let mut root = Layer::new("Controller", "users#index", start);
        root.add_child(query("User/find", start, 10, json!(1)));
        root.add_child(query("User/find", start, 30, json!(3)));
        root.add_child(query("Post/load", start, 5, json!(20)));
        root.add_child(stopped("View", "users/index", start, 5));
        root.record_stop_time(start + Duration::from_millis(100));

        let request = TrackedRequest::finished(agent.clone(), RequestType::Web, root);
        let view = RequestView::new(&request, &agent, request.root_layer().unwrap());
        run(view, Box::new(DatabaseConverter::new(view)));

        let tracked = store.db_query_metrics.lock().unwrap();
        assert_eq!(tracked.len(), 1);
        let queries = &tracked[0];
        assert_eq!(queries.len(), 2);

        let user_find = queries.get("User#find").unwrap();
        assert_eq!(user_find.call_count, 2);
        assert_eq!(user_find.rows_returned, 4);
        assert_eq!(user_find.min_rows_returned, 1);
        assert_eq!(user_find.max_rows_returned, 3);
        assert!((user_find.call_time - 0.04).abs() < 1e-9);
        assert_eq!(queries.get("Post#load").map(|q| q.rows_returned), Some(20));
    }

    #[test]
    fn test_no_scope_layer_tracks_nothing() {
        let (agent, store) = agent_with(AgentConfig::default());
        let start = Instant::now();
        let mut root = Layer::new("Middleware", "Rack", start);
        root.add_child(query("User/find", start, 10, json!(1)));
        root.record_stop_time(start + Duration::from_millis(20));

        let request = TrackedRequest::finished(agent.clone(), RequestType::Web, root);
        let view = RequestView::new(&request, &agent, request.root_layer().unwrap());
        run(view, Box::new(DatabaseConverter::new(view)));
        assert!(store.db_query_metrics.lock().unwrap().is_empty());
    }

    #[test]
    fn test_no_scope_layer_skips_annotations() {
        let (agent, _) = agent_with(AgentConfig::default());
        let start = Instant::now();
        let mut root = Layer::new("Middleware", "Rack", start);
        root.add_child(query("User/find", start, 10, json!("many")));
        root.record_stop_time(start + Duration::from_millis(20));

        let request = TrackedRequest::finished(agent.clone(), RequestType::Web, root);
        let view = RequestView::new(&request, &agent, request.root_layer().unwrap());
        let mut converter = DatabaseConverter::new(view);
        let child = LayerNode::Detailed(&view.root.children().layers()[0]);
        assert!(converter.visit(child).is_ok());
        assert!(converter.queries.is_empty());
    }

    #[test]
    fn test_split_name_defaults() {
        assert_eq!(split_name("User/find"), ("User", "find"));
        assert_eq!(split_name("User"), ("User", "other"));
        assert_eq!(split_name(""), ("SQL", "other"));
    }

    #[test]
    fn test_malformed_record_count() {
        assert_eq!(rows_returned(None).ok(), Some(0));
        assert!(rows_returned(Some(&json!(-1))).is_err());
        assert!(rows_returned(Some(&json!("many"))).is_err());
    }
}
