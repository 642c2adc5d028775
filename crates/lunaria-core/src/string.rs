//! String storage and interning.
//!
//! Short strings (at most [`MAX_SHORT_LEN`] bytes) are stored inline and
//! interned: equal content always resolves to the same [`StringId`].
//! Long strings are allocated individually and hashed lazily.

use crate::error::LuaError;
use crate::gc::{Arena, Color, GcHeader};
use crate::object::GcRef;
use crate::state::GlobalState;
use std::cell::Cell;
use std::fmt;

/// Maximum length of an interned (short) string.
pub const MAX_SHORT_LEN: usize = 40;

/// Initial and minimum number of buckets in the string table.
pub const MIN_STRTAB_SIZE: usize = 128;

/// Rows and associativity of the literal-creation cache.
pub const STRCACHE_N: usize = 53;
pub const STRCACHE_M: usize = 2;

/// At most about 2^HASH_LIMIT bytes of a string feed the hash.
const HASH_LIMIT: u32 = 5;

/// An opaque handle to a string in the interner.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct StringId(pub u32);

/// Internal storage for string data.
enum StringData {
    Short { buf: [u8; MAX_SHORT_LEN], len: u8 },
    Long(Box<[u8]>),
}

/// A string object.
pub struct TString {
    data: StringData,
    /// For short strings the content hash; for long strings the seed until
    /// the hash is first requested.
    hash: Cell<u32>,
    hashed: Cell<bool>,
    /// Next string in the same string-table bucket.
    hnext: Option<StringId>,
}

impl TString {
    fn short(bytes: &[u8], hash: u32) -> Self {
        debug_assert!(bytes.len() <= MAX_SHORT_LEN);
        let mut buf = [0u8; MAX_SHORT_LEN];
        buf[..bytes.len()].copy_from_slice(bytes);
        TString {
            data: StringData::Short {
                buf,
                len: bytes.len() as u8,
            },
            hash: Cell::new(hash),
            hashed: Cell::new(true),
            hnext: None,
        }
    }

    fn long(bytes: &[u8], seed: u32) -> Self {
        TString {
            data: StringData::Long(bytes.into()),
            hash: Cell::new(seed),
            hashed: Cell::new(false),
            hnext: None,
        }
    }

    /// Get the bytes of this string.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.data {
            StringData::Short { buf, len } => &buf[..*len as usize],
            StringData::Long(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_short(&self) -> bool {
        matches!(&self.data, StringData::Short { .. })
    }

    /// Hash of the string, computed on first use for long strings.
    pub fn hash(&self) -> u32 {
        if !self.hashed.get() {
            self.hash.set(lua_hash(self.as_bytes(), self.hash.get()));
            self.hashed.set(true);
        }
        self.hash.get()
    }

    pub fn has_hash(&self) -> bool {
        self.hashed.get()
    }

    /// Estimated allocation size of a string of `len` bytes.
    pub fn mem_size(len: usize) -> usize {
        std::mem::size_of::<TString>() + len + 1
    }
}

impl fmt::Debug for TString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// Seeded string hash. Long inputs are sampled with a stride so hashing
/// stays cheap.
pub fn lua_hash(bytes: &[u8], seed: u32) -> u32 {
    let mut l = bytes.len();
    let mut h = seed ^ (l as u32);
    let step = (l >> HASH_LIMIT) + 1;
    while l >= step {
        h ^= (h << 5)
            .wrapping_add(h >> 2)
            .wrapping_add(bytes[l - 1] as u32);
        l -= step;
    }
    h
}

/// Bucket index for a hash in a power-of-two table.
#[inline]
fn lmod(h: u32, size: usize) -> usize {
    (h as usize) & (size - 1)
}

/// The string table plus the storage for every string object.
pub struct StringInterner {
    arena: Arena<TString>,
    buckets: Vec<Option<StringId>>,
    nuse: usize,
    seed: u32,
    /// Literal-creation cache, rows keyed by source address.
    cache: [[StringId; STRCACHE_M]; STRCACHE_N],
}

impl StringInterner {
    pub fn new(seed: u32) -> Self {
        StringInterner {
            arena: Arena::new(),
            buckets: Vec::new(),
            nuse: 0,
            seed,
            cache: [[StringId(0); STRCACHE_M]; STRCACHE_N],
        }
    }

    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Number of buckets.
    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    /// Number of interned short strings.
    pub fn nuse(&self) -> usize {
        self.nuse
    }

    /// Number of live string objects, short and long.
    pub fn count(&self) -> usize {
        self.arena.len()
    }

    #[inline]
    pub fn get(&self, id: StringId) -> &TString {
        self.arena.get(id.0).expect("string was freed")
    }

    #[inline]
    pub fn get_bytes(&self, id: StringId) -> &[u8] {
        self.get(id).as_bytes()
    }

    pub fn is_live(&self, id: StringId) -> bool {
        self.arena.is_live(id.0)
    }

    #[inline]
    pub fn is_short(&self, id: StringId) -> bool {
        self.get(id).is_short()
    }

    #[inline]
    pub fn hash(&self, id: StringId) -> u32 {
        self.get(id).hash()
    }

    /// Content equality for two long strings.
    pub fn long_eq(&self, a: StringId, b: StringId) -> bool {
        let (sa, sb) = (self.get(a), self.get(b));
        !sa.is_short() && !sb.is_short() && sa.as_bytes() == sb.as_bytes()
    }

    #[inline]
    pub fn header(&self, id: StringId) -> &GcHeader {
        self.arena.header(id.0)
    }

    #[inline]
    pub fn header_mut(&mut self, id: StringId) -> &mut GcHeader {
        self.arena.header_mut(id.0)
    }

    /// Look up an interned short string by content.
    pub fn find_short(&self, bytes: &[u8], h: u32) -> Option<StringId> {
        if self.buckets.is_empty() {
            return None;
        }
        let mut cur = self.buckets[lmod(h, self.buckets.len())];
        while let Some(id) = cur {
            let ts = self.get(id);
            if ts.as_bytes() == bytes {
                return Some(id);
            }
            cur = ts.hnext;
        }
        None
    }

    /// Store a new short string and chain it into its bucket.
    pub fn insert_short(&mut self, bytes: &[u8], h: u32, color: Color) -> StringId {
        let mut ts = TString::short(bytes, h);
        let b = lmod(h, self.buckets.len());
        ts.hnext = self.buckets[b];
        let id = StringId(self.arena.alloc(ts, color));
        self.buckets[b] = Some(id);
        self.nuse += 1;
        id
    }

    /// Store a new long string. It is not entered in the string table.
    pub fn create_long(&mut self, bytes: &[u8], color: Color) -> StringId {
        StringId(self.arena.alloc(TString::long(bytes, self.seed), color))
    }

    /// Rehash every interned string into `newsize` buckets.
    pub fn resize(&mut self, newsize: usize) {
        debug_assert!(newsize.is_power_of_two());
        let old = std::mem::replace(&mut self.buckets, vec![None; newsize]);
        for head in old {
            let mut cur = head;
            while let Some(id) = cur {
                let ts = self.arena.get_mut(id.0).expect("string was freed");
                cur = ts.hnext;
                let b = lmod(ts.hash.get(), newsize);
                ts.hnext = self.buckets[b];
                self.buckets[b] = Some(id);
            }
        }
    }

    /// Free a string object, unlinking it from the string table if short.
    /// Returns the accounted size.
    pub fn free(&mut self, id: StringId) -> usize {
        let (short, h, next) = {
            let ts = self.get(id);
            (ts.is_short(), ts.hash.get(), ts.hnext)
        };
        if short {
            let b = lmod(h, self.buckets.len());
            if self.buckets[b] == Some(id) {
                self.buckets[b] = next;
            } else {
                let mut cur = self.buckets[b];
                while let Some(prev) = cur {
                    let p = self.arena.get_mut(prev.0).expect("string was freed");
                    if p.hnext == Some(id) {
                        p.hnext = next;
                        break;
                    }
                    cur = p.hnext;
                }
            }
            self.nuse -= 1;
        }
        self.arena
            .free(id.0)
            .map(|ts| TString::mem_size(ts.len()))
            .unwrap_or(0)
    }

    /// Fill every cache entry with a string that is never collected.
    pub fn init_cache(&mut self, fixed: StringId) {
        self.cache = [[fixed; STRCACHE_M]; STRCACHE_N];
    }

    fn cache_row(src: &'static str) -> usize {
        (src.as_ptr() as usize) % STRCACHE_N
    }

    fn cache_lookup(&self, src: &'static str) -> Option<StringId> {
        self.cache[Self::cache_row(src)]
            .iter()
            .copied()
            .find(|&id| self.get_bytes(id) == src.as_bytes())
    }

    fn cache_insert(&mut self, src: &'static str, id: StringId) {
        let row = &mut self.cache[Self::cache_row(src)];
        row.copy_within(0..STRCACHE_M - 1, 1);
        row[0] = id;
    }

    /// Replace cache entries that are about to be collected.
    pub fn clear_cache(&mut self, fixed: StringId) {
        for r in 0..STRCACHE_N {
            for c in 0..STRCACHE_M {
                let id = self.cache[r][c];
                if self.header(id).color.is_white() {
                    self.cache[r][c] = fixed;
                }
            }
        }
    }

    /// All live string ids.
    pub fn ids(&self) -> impl Iterator<Item = StringId> + '_ {
        self.arena.live_indices().map(StringId)
    }
}

impl GlobalState {
    /// Create (or reuse) the string object for `bytes`.
    pub fn new_string(&mut self, bytes: &[u8]) -> Result<StringId, LuaError> {
        if bytes.len() <= MAX_SHORT_LEN {
            self.intern_short(bytes)
        } else {
            self.reserve(TString::mem_size(bytes.len()))?;
            let id = self.strings.create_long(bytes, self.gc.current_white);
            self.link_new(GcRef::String(id), TString::mem_size(bytes.len()));
            Ok(id)
        }
    }

    pub fn new_str(&mut self, s: &str) -> Result<StringId, LuaError> {
        self.new_string(s.as_bytes())
    }

    /// Create a string from a literal, consulting the address-keyed cache.
    ///
    /// The cache is keyed by the literal's address and verified by content,
    /// so it is only offered for `'static` sources.
    pub fn new_literal(&mut self, src: &'static str) -> Result<StringId, LuaError> {
        if let Some(id) = self.strings.cache_lookup(src) {
            return Ok(id);
        }
        let id = self.new_string(src.as_bytes())?;
        self.strings.cache_insert(src, id);
        Ok(id)
    }

    fn intern_short(&mut self, bytes: &[u8]) -> Result<StringId, LuaError> {
        let h = lua_hash(bytes, self.strings.seed());
        if let Some(id) = self.strings.find_short(bytes, h) {
            let white = self.gc.current_white;
            let header = self.strings.header_mut(id);
            if header.color == white.other_white() {
                // dead but not yet swept
                header.color = white;
            }
            return Ok(id);
        }
        let size = self.strings.size();
        if self.strings.nuse() >= size && size <= (i32::MAX as usize) / 2 {
            self.resize_string_table(size * 2)?;
        }
        self.reserve(TString::mem_size(bytes.len()))?;
        let id = self.strings.insert_short(bytes, h, self.gc.current_white);
        self.link_new(GcRef::String(id), TString::mem_size(bytes.len()));
        Ok(id)
    }

    /// Resize the string table, accounting the bucket array.
    pub fn resize_string_table(&mut self, newsize: usize) -> Result<(), LuaError> {
        let slot = std::mem::size_of::<Option<StringId>>();
        let old = self.strings.size();
        if newsize <= old {
            self.shrink_string_table(newsize);
            return Ok(());
        }
        self.reserve((newsize - old) * slot)?;
        self.gc.account_alloc((newsize - old) * slot);
        tracing::debug!(old, new = newsize, "string table resized");
        self.strings.resize(newsize);
        Ok(())
    }

    /// Shrink the string table to `newsize` buckets. Never allocates.
    pub fn shrink_string_table(&mut self, newsize: usize) {
        let slot = std::mem::size_of::<Option<StringId>>();
        let old = self.strings.size();
        debug_assert!(newsize <= old);
        self.gc.account_free((old - newsize) * slot);
        tracing::debug!(old, new = newsize, "string table resized");
        self.strings.resize(newsize);
    }

    /// Bytes of a string as UTF-8, lossily. Convenience for hosts and tests.
    pub fn string_lossy(&self, id: StringId) -> String {
        String::from_utf8_lossy(self.strings.get_bytes(id)).into_owned()
    }
}
