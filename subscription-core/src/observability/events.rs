//! Canonical structured event names used across `subscription-core`.

// Intrusive list events.
pub const LIST_INSERT_REJECTED: &str = "list_insert_rejected";
pub const LIST_FREE_REJECTED: &str = "list_free_rejected";
pub const LIST_CAPACITY_EXHAUSTED: &str = "list_capacity_exhausted";
pub const LIST_TRACE: &str = "list_trace";

// Throttle events.
pub const THROTTLE_RATE_SET: &str = "throttle_rate_set";
pub const THROTTLE_DISPATCH_SYNC: &str = "throttle_dispatch_sync";
pub const THROTTLE_DISPATCH_QUEUED: &str = "throttle_dispatch_queued";
pub const THROTTLE_TIMER_START: &str = "throttle_timer_start";
pub const THROTTLE_TIMER_STOP: &str = "throttle_timer_stop";
pub const THROTTLE_DRAIN_DISABLED: &str = "throttle_drain_disabled";
pub const THROTTLE_OWNER_PURGE: &str = "throttle_owner_purge";
pub const THROTTLE_DESTROY: &str = "throttle_destroy";

// Image request events.
pub const IMAGE_REQUEST_SEND: &str = "image_request_send";
pub const IMAGE_REQUEST_SEND_FAILED: &str = "image_request_send_failed";
pub const IMAGE_REQUEST_RETRY: &str = "image_request_retry";
pub const IMAGE_REQUEST_TIMEOUT: &str = "image_request_timeout";
pub const IMAGE_REQUEST_COMPLETE: &str = "image_request_complete";
pub const IMAGE_REQUEST_STOP: &str = "image_request_stop";
pub const IMAGE_REQUEST_REPLY_DROPPED: &str = "image_request_reply_dropped";

// Subscription lifecycle events.
pub const SUBSCRIPTION_SETUP: &str = "subscription_setup";
pub const SUBSCRIPTION_SETUP_FAILED: &str = "subscription_setup_failed";
pub const SUBSCRIPTION_TRANSITION: &str = "subscription_transition";
pub const SUBSCRIPTION_INVALID_STATE: &str = "subscription_invalid_state";
pub const SUBSCRIPTION_BRIDGE_CREATE: &str = "subscription_bridge_create";
pub const SUBSCRIPTION_BRIDGE_CREATE_FAILED: &str = "subscription_bridge_create_failed";
pub const SUBSCRIPTION_BRIDGE_DESTROY: &str = "subscription_bridge_destroy";
pub const SUBSCRIPTION_BRIDGE_DESTROY_FAILED: &str = "subscription_bridge_destroy_failed";
pub const SUBSCRIPTION_DESTROYED_CALLBACK: &str = "subscription_destroyed_callback";
pub const SUBSCRIPTION_MSG_FILTERED: &str = "subscription_msg_filtered";
pub const SUBSCRIPTION_NOT_ENTITLED: &str = "subscription_not_entitled";
pub const SUBSCRIPTION_MSG_RECEIVED: &str = "subscription_msg_received";
pub const SUBSCRIPTION_CONTEXT_CREATE: &str = "subscription_context_create";

// Endpoint pool events.
pub const ENDPOINT_REGISTER: &str = "endpoint_register";
pub const ENDPOINT_REGISTER_REUSE: &str = "endpoint_register_reuse";
pub const ENDPOINT_UNREGISTER: &str = "endpoint_unregister";

// Runtime events.
pub const RUNTIME_SPAWN_START: &str = "runtime_spawn_start";
pub const RUNTIME_SPAWN_OK: &str = "runtime_spawn_ok";
pub const RUNTIME_SPAWN_FAILED: &str = "runtime_spawn_failed";
