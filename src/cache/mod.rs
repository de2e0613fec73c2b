/*
 * Copyright (c) 2022 Shi Lei
 *
 * Use of this source code is governed by a MIT-style license
 * that can be found in the LICENSE file or
 * at https://opensource.org/licenses/MIT
 */

pub mod backing_store;
pub mod cache;
pub mod stream;
pub mod writeback;

pub use backing_store::{BackingStore, MemoryBackingStore};
pub use cache::{Cache, PTE_DIRTY, PTE_VALID};
pub use stream::{InputStream, OutputStream, Stream};
pub use writeback::CacheFactory;
