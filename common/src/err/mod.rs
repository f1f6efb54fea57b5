pub mod server_error;

use crate::err::server_error::ServerError;

pub type SResult<T> = Result<T, ServerError>;
