pub mod headers;
pub mod request;
pub mod response;
pub mod uri;

pub use headers::Headers;
pub use request::Request;
pub use response::Response;
