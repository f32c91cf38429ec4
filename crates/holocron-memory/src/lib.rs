pub mod build;
pub mod cache;
pub mod document;
pub mod embedding;
pub mod migrations;
pub mod roster;
pub mod search_index;

use std::sync::Once;

use sha2::{Digest, Sha256};

pub use build::{AbilitySummarizer, BuildReport, IndexBuildError, IndexBuilder};
pub use cache::CacheStore;
pub use embedding::{
    CachedEmbeddingProvider, EmbeddingProvider, EmbeddingResult, GeminiEmbeddingProvider,
    StubEmbeddingProvider,
};
pub use roster::{Roster, RosterError, UnitBrief};
pub use search_index::{SearchHit, UnitIndex};

static SQLITE_VEC: Once = Once::new();

/// Register sqlite-vec as an auto extension. Must run before any
/// `Connection::open()` that needs `vec0` tables.
pub(crate) fn init_sqlite_vec() {
    use std::os::raw::c_char;

    use rusqlite::ffi::{sqlite3, sqlite3_api_routines, sqlite3_auto_extension};

    type Sqlite3AutoExtFn =
        unsafe extern "C" fn(*mut sqlite3, *mut *mut c_char, *const sqlite3_api_routines) -> i32;

    SQLITE_VEC.call_once(|| unsafe {
        sqlite3_auto_extension(Some(std::mem::transmute::<*const (), Sqlite3AutoExtFn>(
            sqlite_vec::sqlite3_vec_init as *const (),
        )));
    });
}

/// Hex sha256 of `text`, used as the content key for every cache table.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}
