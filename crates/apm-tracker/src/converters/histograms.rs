// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{LayerConverter, RequestView};
use crate::errors::ConvertError;

/// Feeds the request's total time into its endpoint's latency histogram.
pub struct HistogramsConverter<'a> {
    view: RequestView<'a>,
}

impl<'a> HistogramsConverter<'a> {
    #[must_use]
    pub fn new(view: RequestView<'a>) -> Self {
        Self { view }
    }
}

impl<'a> LayerConverter<'a> for HistogramsConverter<'a> {
    fn name(&self) -> &'static str {
        "histograms"
    }

    fn record(self: Box<Self>) -> Result<(), ConvertError> {
        if let Some(name) = self.view.unique_name() {
            let total = self.view.root.total_call_time().as_secs_f64();
            self.view.agent.request_histograms().add(&name, total);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::test_support::{agent_with, run, stopped};
    use crate::tracked_request::{RequestType, TrackedRequest};
    use std::time::Instant;

    #[test]
    fn test_web_request_recorded_under_unique_name() {
        let (agent, _) = agent_with(AgentConfig::default());
        let request = TrackedRequest::finished(
            agent.clone(),
            RequestType::Web,
            stopped("Controller", "users#index", Instant::now(), 250),
        );
        let view = RequestView::new(&request, &agent, request.root_layer().unwrap());
        run(view, Box::new(HistogramsConverter::new(view)));

        let histogram = agent
            .request_histograms()
            .snapshot("Controller/users#index")
            .unwrap();
        assert_eq!(histogram.total(), 1);
        assert_eq!(histogram.quantile(50.0), 0.25);
    }

    #[test]
    fn test_unknown_request_is_not_recorded() {
        let (agent, _) = agent_with(AgentConfig::default());
        let request = TrackedRequest::finished(
            agent.clone(),
            RequestType::Unknown,
            stopped("Controller", "users#index", Instant::now(), 250),
        );
        let view = RequestView::new(&request, &agent, request.root_layer().unwrap());
        run(view, Box::new(HistogramsConverter::new(view)));

        assert!(agent
            .request_histograms()
            .snapshot("Controller/users#index")
            .is_none());
    }
}
