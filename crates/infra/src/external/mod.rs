//! Remote collaborators: the PDP and the operator alert channel.

pub mod alert;
pub mod pdp;

pub use alert::{
    AlertError, AlertNotifier, AlertSeverity, InMemoryAlertNotifier, LogAlertNotifier, RecordedAlert,
    WebhookAlertNotifier,
};
pub use pdp::{
    AllowListUpdateRequest, AllowListUpdateResponse, GrantDuration, HttpPdpClient, PdpClient,
    PdpClientConfig, PdpError, PolicyMetadataCreateResponse, SelectedFieldRecord,
};
