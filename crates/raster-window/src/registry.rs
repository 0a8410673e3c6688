//! Process-wide registry of one `WindowPool` per image.
//!
//! The window pool itself is per-image state (spec: "one pool per
//! image"); this registry is the lazy-create-on-first-use lookup that
//! lets regions on the same image, from any thread, share the pool.

use crate::WindowPool;
use raster_common::ImageId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

static REGISTRY: OnceLock<Mutex<HashMap<ImageId, Arc<WindowPool>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<ImageId, Arc<WindowPool>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Fetch (creating if needed) the window pool for `image_id`.
pub fn pool_for(image_id: ImageId) -> Arc<WindowPool> {
    let mut map = registry().lock().expect("window pool registry poisoned");
    map.entry(image_id)
        .or_insert_with(|| Arc::new(WindowPool::new()))
        .clone()
}

/// Drop the pool entry for an image entirely. Used when an image is
/// torn down; any `Window`s still outstanding keep their own `Arc<Mmap>`
/// alive regardless.
pub fn drop_pool(image_id: ImageId) {
    registry().lock().expect("window pool registry poisoned").remove(&image_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_image_id_returns_same_pool() {
        let a = pool_for(999);
        let b = pool_for(999);
        assert!(Arc::ptr_eq(&a, &b));
        drop_pool(999);
    }
}
