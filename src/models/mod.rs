mod api;

pub use api::{
    HealthResponse, IpPatternRequest, OriginRequest, QuotaResetRequest, SocketRejection,
    UpdatedResponse,
};
