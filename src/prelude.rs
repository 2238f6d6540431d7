//! **The Iridium Prelude**
//!
//! The purpose of this module is to *simplify*, *make module dependencies obvious*,
//! and *keep consistency* in the development of the Iridium proxy.

// External commonly used dependencies
pub use bytes::{Bytes, BytesMut};
pub use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
pub use log::{debug, error, info, trace, warn};
pub use std::borrow::Cow;
pub use std::collections::{BTreeMap, HashMap};
pub use std::fmt::{self, Debug, Display, Formatter};
pub use std::io;
pub use std::net::{IpAddr, SocketAddr};
pub use std::path::{Path, PathBuf};
pub use std::str;
pub use std::sync::Arc;
pub use std::time::{Duration, Instant, SystemTime};

// Crate types
pub use crate::cache::EdgeCache;
pub use crate::config::Config;
pub use crate::dispatch::Context;
pub use crate::host::{Host, Location};
pub use crate::parse::Request;
pub use crate::response::Reply;
pub use crate::{Stream, SERVER_NAME, VERSION};

/// Networking imports for modules touching sockets.
pub mod networking {
    pub use tokio::io::{
        AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt,
        BufReader,
    };
    pub use tokio::net::{TcpListener, TcpStream};
    pub use tokio::time::timeout;
}
