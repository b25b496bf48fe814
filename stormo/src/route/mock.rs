use std::sync::Arc;

use super::Router;
use crate::{endpoint::Endpoint, error::RpcError, invocation::Invocation, url::Url};

/// Attachment key a caller sets to ask for mock endpoints.
pub const NEED_MOCK_KEY: &str = "invocation.need.mock";

const MOCK_PROTOCOL: &str = "mock";

/// The terminal router of every pipeline: keeps mock-protocol endpoints in
/// and real ones out when the invocation asks for mocks, and the reverse
/// otherwise.
pub struct MockSelector {
    url: Url,
}

impl Default for MockSelector {
    fn default() -> Self {
        Self {
            url: Url::new(MOCK_PROTOCOL, "0.0.0.0", 0),
        }
    }
}

impl MockSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Router for MockSelector {
    fn url(&self) -> &Url {
        &self.url
    }

    // always runs after every configured router
    fn priority(&self) -> i32 {
        i32::MAX
    }

    fn runtime(&self) -> bool {
        true
    }

    fn route(
        &self,
        endpoints: Vec<Arc<dyn Endpoint>>,
        _consumer: &Url,
        invocation: Option<&Invocation>,
    ) -> Result<Vec<Arc<dyn Endpoint>>, RpcError> {
        let need_mock = invocation
            .and_then(|inv| inv.attachment(NEED_MOCK_KEY))
            .is_some_and(|v| v == "true");
        Ok(endpoints
            .into_iter()
            .filter(|ep| (ep.url().protocol() == MOCK_PROTOCOL) == need_mock)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{MockSelector, NEED_MOCK_KEY};
    use crate::{
        endpoint::Endpoint, invocation::Invocation, route::Router, testing::MockEndpoint,
        url::Url,
    };

    fn mixed_endpoints() -> Vec<Arc<dyn Endpoint>> {
        let real = MockEndpoint::ok("10.0.0.1", 20880);
        let mock = MockEndpoint::with_url(
            Url::new("mock", "10.0.0.2", 20880).with_path("com.foo.BarService"),
        );
        vec![real, mock]
    }

    #[test]
    fn test_mocks_filtered_out_by_default() {
        let selector = MockSelector::new();
        let consumer = Url::new("stormo", "127.0.0.1", 0);
        let inv = Invocation::new("find");
        let routed = selector.route(mixed_endpoints(), &consumer, Some(&inv)).unwrap();
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].url().protocol(), "stormo");
    }

    #[test]
    fn test_mocks_selected_on_request() {
        let selector = MockSelector::new();
        let consumer = Url::new("stormo", "127.0.0.1", 0);
        let mut inv = Invocation::new("find");
        inv.set_attachment(NEED_MOCK_KEY, "true");
        let routed = selector.route(mixed_endpoints(), &consumer, Some(&inv)).unwrap();
        assert_eq!(routed.len(), 1);
        assert_eq!(routed[0].url().protocol(), "mock");
    }
}
