/// Method name carried in every change notification, consumed by the
/// advertisement daemon to trigger a re-publish.
pub const NOTIFY_METHOD: &str = "emitBonjourChanged";

/// Default header carrying the authenticated user id, set by the front proxy
pub const DEFAULT_IDENTITY_HEADER: &str = "x-authenticated-user";

/// Prefix every owner and worker route is nested under
pub const API_PREFIX: &str = "/v1";
