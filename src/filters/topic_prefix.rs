//! Reference filter pair exercising `SHORT_CIRCUIT` end to end: rejects
//! `CreateTopics` requests that name a topic without a configured
//! prefix, answering the client directly with a per-topic
//! `INVALID_TOPIC_EXCEPTION` instead of forwarding to the broker
//! (spec.md §8 scenario 5).

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use kafka_protocol::error::ResponseError;
use kafka_protocol::messages::create_topics_response::CreatableTopicResult;
use kafka_protocol::messages::{ApiKey, CreateTopicsResponse, RequestKind, ResponseKind};
use kafka_protocol::protocol::StrBytes;

use crate::filter::{
    DecodedRequest, FilterContext, KafkaFilter, RequestFilter, RequestResult, ResponseFilter,
};

pub struct TopicPrefixFilter {
    required_prefix: String,
}

impl TopicPrefixFilter {
    pub fn new(required_prefix: impl Into<String>) -> Arc<Self> {
        Arc::new(TopicPrefixFilter {
            required_prefix: required_prefix.into(),
        })
    }
}

#[async_trait]
impl RequestFilter for TopicPrefixFilter {
    fn name(&self) -> &str {
        "topic_prefix"
    }

    fn should_deserialize(&self, api_key: ApiKey, _api_version: i16) -> bool {
        api_key == ApiKey::CreateTopicsKey
    }

    async fn apply(
        &self,
        request: DecodedRequest,
        _context: &dyn FilterContext,
    ) -> anyhow::Result<RequestResult> {
        let RequestKind::CreateTopics(create) = &request.body else {
            return Ok(RequestResult::forward(request.header, request.body));
        };

        let offending: Vec<StrBytes> = create
            .topics
            .keys()
            .filter(|name| !name.as_str().starts_with(self.required_prefix.as_str()))
            .cloned()
            .collect();

        if offending.is_empty() {
            return Ok(RequestResult::forward(request.header, request.body));
        }

        let mut topics = IndexMap::new();
        for name in create.topics.keys() {
            let result = if offending.contains(name) {
                CreatableTopicResult::default()
                    .with_name(name.clone())
                    .with_error_code(ResponseError::InvalidTopicException.code())
                    .with_error_message(Some(StrBytes::from_static_str(
                        "topic name missing required prefix",
                    )))
            } else {
                CreatableTopicResult::default().with_name(name.clone())
            };
            topics.insert(name.clone(), result);
        }

        let response = CreateTopicsResponse::default().with_topics(topics);
        Ok(RequestResult::short_circuit(ResponseKind::CreateTopics(
            response,
        )))
    }
}

impl KafkaFilter for TopicPrefixFilter {
    fn name(&self) -> &str {
        "topic_prefix"
    }

    fn as_request_filter(self: Arc<Self>) -> Option<Arc<dyn RequestFilter>> {
        Some(self)
    }

    fn as_response_filter(self: Arc<Self>) -> Option<Arc<dyn ResponseFilter>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kafka_protocol::messages::create_topics_request::CreatableTopic;
    use kafka_protocol::messages::{CreateTopicsRequest, RequestHeader};

    struct NoopContext;

    #[async_trait]
    impl FilterContext for NoopContext {
        fn correlation_id(&self) -> i32 {
            1
        }

        async fn originate_request(
            &self,
            _api_key: ApiKey,
            _api_version: i16,
            _body: RequestKind,
        ) -> anyhow::Result<crate::frame::ResponseBody> {
            unreachable!("not exercised by this filter")
        }

        fn virtual_cluster(&self) -> &str {
            "default"
        }
    }

    fn topic(name: &str) -> (StrBytes, CreatableTopic) {
        (
            StrBytes::from_string(name.to_string()),
            CreatableTopic::default(),
        )
    }

    #[tokio::test]
    async fn rejects_topic_without_prefix() {
        let filter = TopicPrefixFilter::new("team-a.");
        let mut topics = IndexMap::new();
        let (name, body) = topic("unprefixed-topic");
        topics.insert(name, body);
        let request = CreateTopicsRequest::default().with_topics(topics);

        let decoded = DecodedRequest {
            api_key: ApiKey::CreateTopicsKey,
            api_version: 5,
            correlation_id: 1,
            header: RequestHeader::default(),
            body: RequestKind::CreateTopics(request),
        };

        let result = filter.apply(decoded, &NoopContext).await.unwrap();
        assert!(matches!(result, RequestResult::ShortCircuit { .. }));
    }

    #[tokio::test]
    async fn forwards_topic_with_prefix() {
        let filter = TopicPrefixFilter::new("team-a.");
        let mut topics = IndexMap::new();
        let (name, body) = topic("team-a.orders");
        topics.insert(name, body);
        let request = CreateTopicsRequest::default().with_topics(topics);

        let decoded = DecodedRequest {
            api_key: ApiKey::CreateTopicsKey,
            api_version: 5,
            correlation_id: 1,
            header: RequestHeader::default(),
            body: RequestKind::CreateTopics(request),
        };

        let result = filter.apply(decoded, &NoopContext).await.unwrap();
        assert!(matches!(result, RequestResult::Forward { .. }));
    }
}
