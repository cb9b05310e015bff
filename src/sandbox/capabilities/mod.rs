//! Script-visible capability groups.

pub mod browser;
pub mod documents;
pub mod filesystem;
pub mod filetype;
pub mod http;
pub mod images;
pub mod logging;
pub mod system;
pub mod utils;

use serde_json::{Map, Value};

/// Mark `fields` as a successful structured result.
pub fn success(fields: Value) -> Value {
    let mut map = match fields {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    map.insert("success".to_string(), Value::Bool(true));
    Value::Object(map)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    use crate::sandbox::config::Config;
    use crate::sandbox::registrar::HostContext;

    pub fn host(config: Config) -> HostContext {
        HostContext {
            sandbox_id: Uuid::new_v4(),
            config: Arc::new(config),
            runtime: tokio::runtime::Handle::current(),
            browser: None,
            scope: CancellationToken::new(),
        }
    }
}
