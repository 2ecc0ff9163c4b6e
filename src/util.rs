//! Shared utility functions.

use std::time::Duration;

use tokio::task::spawn_blocking;
use tokio::time::timeout;

use crate::{Error, Result};

/// Run filesystem work off the reactor thread.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}

pub async fn blocking_with_timeout<F, T>(duration: Duration, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    match timeout(duration, spawn_blocking(f)).await {
        Ok(Ok(inner)) => inner,
        Ok(Err(join_err)) => Err(Error::TaskJoin(join_err.to_string())),
        Err(_) => Err(Error::Timeout(duration)),
    }
}

/// Keep only the last `max_chars` characters of `buf`, respecting char
/// boundaries.
pub fn truncate_front(buf: &mut String, max_chars: usize) {
    let count = buf.chars().count();
    if count <= max_chars {
        return;
    }
    let skip = count - max_chars;
    let byte_idx = buf
        .char_indices()
        .nth(skip)
        .map(|(i, _)| i)
        .unwrap_or(buf.len());
    buf.drain(..byte_idx);
}

/// Lowercase, dash-separated form of `text` for directory names.
pub fn slugify(text: &str, max_len: usize) -> String {
    let mut slug = String::new();
    for word in text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let extra = if slug.is_empty() { word.len() } else { word.len() + 1 };
        if slug.len() + extra > max_len {
            break;
        }
        if !slug.is_empty() {
            slug.push('-');
        }
        slug.push_str(&word.to_ascii_lowercase());
    }
    if slug.is_empty() {
        slug.push_str("task");
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blocking_success() {
        assert_eq!(blocking(|| Ok::<_, Error>(42)).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_blocking_with_timeout_expires() {
        let result = blocking_with_timeout(Duration::from_millis(10), || {
            std::thread::sleep(Duration::from_millis(100));
            Ok::<_, Error>(42)
        })
        .await;
        assert!(matches!(result.unwrap_err(), Error::Timeout(_)));
    }

    #[test]
    fn test_truncate_front_keeps_tail() {
        let mut s = "abcdef".to_string();
        truncate_front(&mut s, 3);
        assert_eq!(s, "def");

        let mut short = "ab".to_string();
        truncate_front(&mut short, 3);
        assert_eq!(short, "ab");
    }

    #[test]
    fn test_truncate_front_multibyte() {
        let mut s = "··ab".to_string();
        truncate_front(&mut s, 3);
        assert_eq!(s, "·ab");
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Add OAuth login (v2)!", 40), "add-oauth-login-v2");
        assert_eq!(slugify("one two three", 7), "one-two");
        assert_eq!(slugify("???", 40), "task");
    }
}
