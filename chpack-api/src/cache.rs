// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::Mutex;

use chpack_common::*;

/// Remembers the channel of one package for the life of a process.
///
/// The first successful lookup wins, including one that found no channel.
/// Later lookups return the remembered value without touching the file.
#[derive(Debug, Default)]
pub struct ChannelCache {
    channel: Mutex<Option<Option<String>>>
}

impl ChannelCache {
    pub fn new() -> ChannelCache {
        ChannelCache::default()
    }

    /// Returns the cached channel, calling `load` under the lock if there is
    /// none yet. A failed `load` leaves the cache empty.
    pub fn get_or_load<F>(&self, load: F) -> Result<Option<String>>
    where
        F: FnOnce() -> Result<Option<String>>
    {
        let mut guard = match self.channel.lock() {
            Ok(guard) => guard,
            // Nothing is left half-written while the lock is held
            Err(poisoned) => poisoned.into_inner()
        };
        if let Some(channel) = guard.as_ref() {
            return Ok(channel.clone());
        }
        let channel = load()?;
        *guard = Some(channel.clone());
        Ok(channel)
    }

    pub fn is_loaded(&self) -> bool {
        match self.channel.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some()
        }
    }

    pub fn reset(&self) {
        match self.channel.lock() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn first_load_wins() {
        let cache = ChannelCache::new();
        assert_eq!(cache.get_or_load(|| Ok(Some("a".into()))).unwrap().as_deref(), Some("a"));
        assert_eq!(cache.get_or_load(|| Ok(Some("b".into()))).unwrap().as_deref(), Some("a"));

        cache.reset();
        assert!(!cache.is_loaded());
        assert_eq!(cache.get_or_load(|| Ok(None)).unwrap(), None);
        // An absent channel is remembered too
        assert_eq!(cache.get_or_load(|| Ok(Some("c".into()))).unwrap(), None);
    }

    #[test]
    fn failures_are_not_cached() {
        let cache = ChannelCache::new();
        assert!(cache.get_or_load(|| Err(ChpackError::NotFound)).is_err());
        assert!(!cache.is_loaded());
        assert_eq!(cache.get_or_load(|| Ok(Some("a".into()))).unwrap().as_deref(), Some("a"));
    }

    #[test]
    fn concurrent_readers_see_one_load() {
        let cache = Arc::new(ChannelCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                thread::spawn(move || {
                    cache
                        .get_or_load(|| Ok(Some(format!("thread-{i}"))))
                        .unwrap()
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    }
}
