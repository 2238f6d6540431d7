//! Utility functions to generate error and fallback response bodies.
//!
//! Error bodies are a minimal HTML page listing the status code and text;
//! they carry no backend identity, no internal paths.

use crate::prelude::*;

/// The reason phrase shown on error pages.
#[must_use]
pub fn status_text(status: StatusCode) -> &'static str {
    status.canonical_reason().unwrap_or("Unknown Error")
}

/// The minimal HTML error page for `status`.
#[must_use]
pub fn error_html(status: StatusCode) -> String {
    let text = status_text(status);
    format!(
        "<!DOCTYPE html><html><head><title>{text}</title></head><body><center>\
         <h1>{code} {text}</h1><hr><p>{SERVER_NAME} v{VERSION}</p></center></body></html>",
        code = status.as_u16(),
    )
}

/// The page served when no host configuration matches the request.
#[must_use]
pub fn fallback_html() -> String {
    format!(
        "<!DOCTYPE html>\n\
         <html>\n  <head>\n    <title>Welcome to {SERVER_NAME}!</title>\n    <meta charset=\"utf-8\">\n  </head>\n  <body>\n\
         \t<center>\n\
         \t  <h1>Welcome to {SERVER_NAME}!</h1>\n\
         \t  <p>This is the default page served by {SERVER_NAME}.</p>\n\
         \t  <p>If you see this page, it means that no host configuration matched your request.</p>\n\
         \t  <hr>\n\
         \t  <p>{SERVER_NAME} v{VERSION}</p>\n\
         \t</center>\n  </body>\n</html>"
    )
}
