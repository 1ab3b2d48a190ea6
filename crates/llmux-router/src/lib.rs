mod info;
mod models;
mod proxy;

pub use info::{InfoCache, info_router};
pub use models::models_payload;
pub use proxy::proxy_router;
