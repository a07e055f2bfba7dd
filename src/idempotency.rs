use redis::AsyncCommands;
use serde::{Serialize, de::DeserializeOwned};

/// Namespaced cache key so one redis can back several deployments.
pub fn cache_key(key: &str) -> String {
    format!("peddler:idem:{key}")
}

pub async fn redis_get<T: DeserializeOwned>(client: &redis::Client, key: &str) -> Option<T> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(_) => return None,
    };
    let s: Option<String> = conn.get(cache_key(key)).await.ok();
    s.and_then(|v| serde_json::from_str(&v).ok())
}

pub async fn redis_set<T: Serialize>(client: &redis::Client, key: &str, value: &T, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(cache_key(key), json, ttl_secs).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_keys_are_namespaced() {
        assert_eq!(cache_key("abc-123"), "peddler:idem:abc-123");
    }
}
