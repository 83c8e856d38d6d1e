// fabric-test-utils: shared test utilities for the connection fabric.
//
// A mock WebSocket client that can drive either authentication path the
// gateway accepts, plus a harness for serving a gateway router on an
// ephemeral port for black-box integration tests.

pub mod harness;
pub mod mock_ws_client;

pub use harness::GatewayHarness;
pub use mock_ws_client::MockWsClient;
