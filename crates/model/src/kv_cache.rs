//! Position-addressed key/value cache for one device's local heads
//!
//! Every user owns a row-major `[positions, local_heads * head_dim]` buffer
//! for keys and one for values. Prefill writes a run of positions for one
//! user; decode writes a single position for each user in the batch.
//! Writes may overwrite earlier positions but never leave a gap.

use parking_lot::Mutex;

use shardlayer_core::{LayerError, Result};

#[derive(Debug, Default, Clone)]
struct UserCache {
    keys: Vec<f32>,
    values: Vec<f32>,
    len: usize,
}

/// KV cache for one device
#[derive(Debug)]
pub struct KvCache {
    width: usize,
    max_batch: usize,
    max_seq_len: usize,
    users: Mutex<Vec<UserCache>>,
}

impl KvCache {
    /// `width` is `local_heads * head_dim`
    pub fn new(width: usize, max_batch: usize, max_seq_len: usize) -> Self {
        Self {
            width,
            max_batch,
            max_seq_len,
            users: Mutex::new(vec![UserCache::default(); max_batch]),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    fn check_user(&self, user: usize) -> Result<()> {
        if user >= self.max_batch {
            return Err(LayerError::Precondition(format!(
                "user {user} out of range for a cache of {} users",
                self.max_batch
            )));
        }
        Ok(())
    }

    /// Store `keys` / `values` (`[rows, width]`) at positions `start_pos..start_pos + rows`
    pub fn write(&self, user: usize, start_pos: usize, keys: &[f32], values: &[f32]) -> Result<()> {
        self.check_user(user)?;
        if keys.len() != values.len() || keys.len() % self.width != 0 {
            return Err(LayerError::shape_mismatch(&[keys.len()], &[values.len()]));
        }
        let rows = keys.len() / self.width;
        let end = start_pos + rows;
        if end > self.max_seq_len {
            return Err(LayerError::Precondition(format!(
                "positions {start_pos}..{end} exceed max_seq_len {}",
                self.max_seq_len
            )));
        }

        let mut users = self.users.lock();
        let cache = &mut users[user];
        if start_pos > cache.len {
            return Err(LayerError::Precondition(format!(
                "user {user} has {} cached positions, cannot write at {start_pos}",
                cache.len
            )));
        }
        if end > cache.len {
            cache.keys.resize(end * self.width, 0.0);
            cache.values.resize(end * self.width, 0.0);
            cache.len = end;
        }
        let range = start_pos * self.width..end * self.width;
        cache.keys[range.clone()].copy_from_slice(keys);
        cache.values[range].copy_from_slice(values);
        Ok(())
    }

    /// Keys and values of positions `0..len`
    pub fn read(&self, user: usize, len: usize) -> Result<(Vec<f32>, Vec<f32>)> {
        self.check_user(user)?;
        let users = self.users.lock();
        let cache = &users[user];
        if len > cache.len {
            return Err(LayerError::Precondition(format!(
                "user {user} has {} cached positions, {len} requested",
                cache.len
            )));
        }
        let n = len * self.width;
        Ok((cache.keys[..n].to_vec(), cache.values[..n].to_vec()))
    }

    /// Number of cached positions for `user`
    pub fn len(&self, user: usize) -> usize {
        self.users.lock().get(user).map(|c| c.len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.users.lock().iter().all(|c| c.len == 0)
    }

    pub fn clear(&self) {
        for cache in self.users.lock().iter_mut() {
            *cache = UserCache::default();
        }
    }
}
