mod dto;
mod routes;

pub use dto::{CreateStreamRequest, CreateStreamResponse, StatusResponse};
pub use routes::{router, AppState};
