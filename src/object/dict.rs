//! `Dict` and `SyncDict`: string-keyed mappings.
//!
//! `Dict` iteration order is deliberately left unspecified unless the
//! iterator's `sorted`/`reversed` option is supplied, so a plain `HashMap`
//! is the right backing store. Sorting, when asked for, happens in the
//! iterator adapter (`crate::iter::adapters`), not here.
//!
//! `SyncDict` is the same mapping guarded by a reader-writer lock: writes
//! take the write lock for the scripted operation, iteration takes the
//! read lock for the whole iteration.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::{Arc, RwLock};

use super::Value;

pub type DictRef = Rc<RefCell<HashMap<String, Value>>>;
pub type SyncDictRef = Arc<RwLock<HashMap<String, Value>>>;
