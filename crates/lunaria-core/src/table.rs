//! Hybrid array+hash table.
//!
//! Integer keys in `1..=array.len()` live in the array part. Everything else
//! lives in a power-of-two node vector using open addressing with chains
//! threaded through relative `next` offsets. A colliding key that is not in
//! its own main position is always the one that moves, so every chain starts
//! at the main position of the keys it holds.

use crate::error::LuaError;
use crate::gc::GcIdx;
use crate::object::TagMethod;
use crate::string::StringInterner;
use crate::value::{float_to_integer, TValue};

/// Largest power of two usable as an array size exponent.
pub const MAXABITS: usize = 31;
pub const MAXASIZE: u64 = 1 << MAXABITS;
/// Largest node vector size exponent.
pub const MAXHBITS: usize = 30;

/// A slot of the hash part.
#[derive(Clone, Copy, Debug, Default)]
pub struct Node {
    pub key: TValue,
    pub val: TValue,
    /// Offset to the next node of the chain, 0 at the end.
    pub next: i32,
    /// The key was collected; it only keeps its identity for `next`.
    pub dead_key: bool,
}

/// A table: array part plus hash part, an optional metatable and a cache
/// of absent fast tag methods.
#[derive(Debug)]
pub struct Table {
    array: Vec<TValue>,
    node: Vec<Node>,
    lsizenode: u8,
    /// Free slots are searched downward from here.
    lastfree: usize,
    pub metatable: Option<GcIdx<Table>>,
    /// Bit set means the tag method is known to be absent.
    pub flags: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Array(usize),
    Node(usize),
}

impl Default for Table {
    fn default() -> Self {
        Table::new(0, 0)
    }
}

impl Table {
    /// Create a new empty table with size hints. Oversized hash hints are clamped.
    pub fn new(array_hint: usize, hash_hint: usize) -> Self {
        let (lsizenode, node) = node_vector(hash_hint.min(1 << MAXHBITS)).unwrap_or_default();
        Table {
            array: vec![TValue::Nil; array_hint],
            lastfree: node.len(),
            node,
            lsizenode,
            metatable: None,
            flags: 0,
        }
    }

    /// Create a table with exact part sizes (the hash part rounds up to a
    /// power of two).
    pub fn with_sizes(narray: usize, nhash: usize) -> Result<Self, LuaError> {
        let (lsizenode, node) = node_vector(nhash)?;
        Ok(Table {
            array: vec![TValue::Nil; narray],
            lastfree: node.len(),
            node,
            lsizenode,
            metatable: None,
            flags: 0,
        })
    }

    pub fn array_len(&self) -> usize {
        self.array.len()
    }

    /// Number of nodes in the hash part (0 for an empty hash part).
    pub fn node_len(&self) -> usize {
        self.node.len()
    }

    pub fn lsizenode(&self) -> u8 {
        self.lsizenode
    }

    pub fn array(&self) -> &[TValue] {
        &self.array
    }

    pub fn array_mut(&mut self) -> &mut [TValue] {
        &mut self.array
    }

    pub fn nodes(&self) -> &[Node] {
        &self.node
    }

    pub fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.node
    }

    /// Estimated allocation size.
    pub fn mem_size(&self) -> usize {
        Self::mem_size_for(self.array.len(), self.node.len())
    }

    pub fn mem_size_for(narray: usize, nnodes: usize) -> usize {
        std::mem::size_of::<Table>()
            + narray * std::mem::size_of::<TValue>()
            + nnodes * std::mem::size_of::<Node>()
    }

    #[inline]
    pub fn invalidate_tm_cache(&mut self) {
        self.flags = 0;
    }

    #[inline]
    pub fn tm_known_absent(&self, tm: TagMethod) -> bool {
        self.flags & tm.flag() != 0
    }

    #[inline]
    pub fn cache_tm_absent(&mut self, tm: TagMethod) {
        if tm.is_fast() {
            self.flags |= tm.flag();
        }
    }

    fn main_position(&self, key: &TValue, strings: &StringInterner) -> usize {
        let size = self.node.len();
        debug_assert!(size > 0);
        let mask = size - 1;
        let hashmod = |h: u64| (h % ((mask as u64) | 1)) as usize;
        match *key {
            TValue::Int(i) => (i as u64 as usize) & mask,
            TValue::Float(f) => hashmod(hash_float(f) as u64),
            TValue::Bool(b) => (b as usize) & mask,
            TValue::Str(id) => (strings.hash(id) as usize) & mask,
            other => match other.gc_ref() {
                Some(r) => hashmod(r.identity()),
                None => 0,
            },
        }
    }

    #[inline]
    fn step(i: usize, next: i32) -> usize {
        (i as isize + next as isize) as usize
    }

    /// Raw get by key. Reads never fail; an absent key yields nil.
    pub fn get(&self, key: TValue, strings: &StringInterner) -> TValue {
        match key {
            TValue::Nil => TValue::Nil,
            TValue::Int(i) => self.get_int(i),
            TValue::Float(f) => match float_to_integer(f) {
                Some(i) => self.get_int(i),
                None => self.get_generic(&key, strings),
            },
            _ => self.get_generic(&key, strings),
        }
    }

    /// Integer-key fast path.
    pub fn get_int(&self, key: i64) -> TValue {
        if key >= 1 && (key as u64) <= self.array.len() as u64 {
            return self.array[(key - 1) as usize];
        }
        if self.node.is_empty() {
            return TValue::Nil;
        }
        let mut i = (key as u64 as usize) & (self.node.len() - 1);
        loop {
            let n = &self.node[i];
            if !n.dead_key && matches!(n.key, TValue::Int(k) if k == key) {
                return n.val;
            }
            if n.next == 0 {
                return TValue::Nil;
            }
            i = Self::step(i, n.next);
        }
    }

    fn get_generic(&self, key: &TValue, strings: &StringInterner) -> TValue {
        match self.find_node(key, strings) {
            Some(i) => self.node[i].val,
            None => TValue::Nil,
        }
    }

    /// Locate the node holding `key`, which must already be normalized.
    fn find_node(&self, key: &TValue, strings: &StringInterner) -> Option<usize> {
        if self.node.is_empty() {
            return None;
        }
        let mut i = self.main_position(key, strings);
        loop {
            let n = &self.node[i];
            if !n.dead_key && n.key.raw_equals(key, strings) {
                return Some(i);
            }
            if n.next == 0 {
                return None;
            }
            i = Self::step(i, n.next);
        }
    }

    /// Look up a long-string key by content. `hash` is the seeded hash of
    /// `bytes`, the same value the key's string object computes lazily.
    pub fn get_long_str(&self, bytes: &[u8], hash: u32, strings: &StringInterner) -> TValue {
        if self.node.is_empty() {
            return TValue::Nil;
        }
        let mut i = (hash as usize) & (self.node.len() - 1);
        loop {
            let n = &self.node[i];
            if let (false, TValue::Str(k)) = (n.dead_key, n.key) {
                if !strings.is_short(k) && strings.get_bytes(k) == bytes {
                    return n.val;
                }
            }
            if n.next == 0 {
                return TValue::Nil;
            }
            i = Self::step(i, n.next);
        }
    }

    fn find_slot(&self, key: &TValue, strings: &StringInterner) -> Option<Slot> {
        if let TValue::Int(k) = *key {
            if k >= 1 && (k as u64) <= self.array.len() as u64 {
                return Some(Slot::Array((k - 1) as usize));
            }
        }
        self.find_node(key, strings).map(Slot::Node)
    }

    /// Store into an existing slot, or into a new node if one is free.
    /// Returns `false` when the table has to be rehashed first.
    /// `key` must be normalized (see [`normalize_key`]).
    pub fn try_set(&mut self, key: TValue, val: TValue, strings: &StringInterner) -> bool {
        match self.find_slot(&key, strings) {
            Some(Slot::Array(i)) => {
                self.array[i] = val;
                true
            }
            Some(Slot::Node(i)) => {
                self.node[i].val = val;
                true
            }
            // assigning nil to an absent key is a no-op
            None if val.is_nil() => true,
            None => match self.new_key(key, strings) {
                Some(i) => {
                    self.node[i].val = val;
                    true
                }
                None => false,
            },
        }
    }

    /// Set a key, rehashing as needed. Does no memory accounting; use
    /// `GlobalState::table_set` for heap tables.
    pub fn set(&mut self, key: TValue, val: TValue, strings: &StringInterner) -> Result<(), LuaError> {
        let key = normalize_key(key)?;
        while !self.try_set(key, val, strings) {
            let (na, nh) = self.rehash_sizes(&key);
            self.resize(na, nh, strings)?;
        }
        Ok(())
    }

    pub fn set_int(&mut self, key: i64, val: TValue, strings: &StringInterner) -> Result<(), LuaError> {
        self.set(TValue::Int(key), val, strings)
    }

    fn get_free_pos(&mut self) -> Option<usize> {
        while self.lastfree > 0 {
            self.lastfree -= 1;
            if self.node[self.lastfree].key.is_nil() {
                return Some(self.lastfree);
            }
        }
        None
    }

    /// Insert a key that is not present, returning its node. The value of
    /// the node is nil. Returns `None` if there is no free node.
    fn new_key(&mut self, key: TValue, strings: &StringInterner) -> Option<usize> {
        if self.node.is_empty() {
            return None;
        }
        let mut mp = self.main_position(&key, strings);
        if !self.node[mp].val.is_nil() {
            let f = self.get_free_pos()?;
            let mut othern = self.main_position(&self.node[mp].key, strings);
            if othern != mp {
                // colliding node is out of its main position: move it
                while Self::step(othern, self.node[othern].next) != mp {
                    othern = Self::step(othern, self.node[othern].next);
                }
                self.node[othern].next = (f as isize - othern as isize) as i32;
                self.node[f] = self.node[mp];
                if self.node[mp].next != 0 {
                    self.node[f].next += (mp as isize - f as isize) as i32;
                    self.node[mp].next = 0;
                }
                self.node[mp].val = TValue::Nil;
            } else {
                // colliding node is in its main position: chain the new one
                if self.node[mp].next != 0 {
                    let target = Self::step(mp, self.node[mp].next);
                    self.node[f].next = (target as isize - f as isize) as i32;
                } else {
                    debug_assert_eq!(self.node[f].next, 0);
                }
                self.node[mp].next = (f as isize - mp as isize) as i32;
                mp = f;
            }
        }
        let n = &mut self.node[mp];
        n.key = key;
        n.dead_key = false;
        debug_assert!(n.val.is_nil());
        Some(mp)
    }

    fn num_use_array(&self, nums: &mut [usize; MAXABITS + 1]) -> usize {
        let mut ause = 0;
        let mut i = 1usize;
        let mut ttlg = 1usize;
        for slot in nums.iter_mut() {
            let mut lim = ttlg;
            if lim > self.array.len() {
                lim = self.array.len();
                if i > lim {
                    break;
                }
            }
            let mut lc = 0;
            while i <= lim {
                if !self.array[i - 1].is_nil() {
                    lc += 1;
                }
                i += 1;
            }
            *slot += lc;
            ause += lc;
            ttlg *= 2;
        }
        ause
    }

    fn num_use_hash(&self, nums: &mut [usize; MAXABITS + 1], na: &mut usize) -> usize {
        let mut total = 0;
        for n in self.node.iter().filter(|n| !n.val.is_nil()) {
            *na += count_int(&n.key, nums);
            total += 1;
        }
        total
    }

    /// Compute the array and hash sizes for the table after `extra` is added:
    /// the array size is the largest power of two with more than half of its
    /// slots in use.
    pub fn rehash_sizes(&self, extra: &TValue) -> (usize, usize) {
        let mut nums = [0usize; MAXABITS + 1];
        let mut na = self.num_use_array(&mut nums);
        let mut total = na;
        total += self.num_use_hash(&mut nums, &mut na);
        na += count_int(extra, &mut nums);
        total += 1;
        let (asize, na) = compute_sizes(&nums, na);
        (asize, total - na)
    }

    /// Resize both parts and reinsert every entry.
    pub fn resize(&mut self, nasize: usize, nhsize: usize, strings: &StringInterner) -> Result<(), LuaError> {
        let (lsize, nodes) = node_vector(nhsize)?;
        let old_nodes = std::mem::replace(&mut self.node, nodes);
        self.lsizenode = lsize;
        self.lastfree = self.node.len();
        let oldasize = self.array.len();
        if nasize > oldasize {
            self.array.resize(nasize, TValue::Nil);
        } else if nasize < oldasize {
            let vanishing = self.array.split_off(nasize);
            self.array.shrink_to_fit();
            for (j, v) in vanishing.into_iter().enumerate() {
                if !v.is_nil() {
                    self.reinsert(TValue::Int((nasize + j + 1) as i64), v, strings);
                }
            }
        }
        for n in old_nodes.into_iter().rev() {
            if !n.val.is_nil() {
                self.reinsert(n.key, n.val, strings);
            }
        }
        Ok(())
    }

    fn reinsert(&mut self, key: TValue, val: TValue, strings: &StringInterner) {
        let stored = self.try_set(key, val, strings);
        debug_assert!(stored, "resized table has no room for an existing key");
    }

    /// A border: some `n` with `t[n]` non-nil and `t[n+1]` nil, or 0.
    pub fn length(&self) -> u64 {
        let mut j = self.array.len();
        if j > 0 && self.array[j - 1].is_nil() {
            let mut i = 0;
            while j - i > 1 {
                let m = (i + j) / 2;
                if self.array[m - 1].is_nil() {
                    j = m;
                } else {
                    i = m;
                }
            }
            return i as u64;
        }
        if self.node.is_empty() {
            return j as u64;
        }
        self.unbound_search(j as u64)
    }

    fn unbound_search(&self, j: u64) -> u64 {
        let mut i = j;
        let mut j = j + 1;
        while !self.get_int(j as i64).is_nil() {
            i = j;
            if j > (i64::MAX as u64) / 2 {
                // pathological table: linear search
                let mut k = 1u64;
                while !self.get_int(k as i64).is_nil() {
                    k += 1;
                }
                return k - 1;
            }
            j *= 2;
        }
        while j - i > 1 {
            let m = (i + j) / 2;
            if self.get_int(m as i64).is_nil() {
                j = m;
            } else {
                i = m;
            }
        }
        i
    }

    /// Traversal: the entry after `key` (nil starts), array part first.
    pub fn next(&self, key: TValue, strings: &StringInterner) -> Result<Option<(TValue, TValue)>, LuaError> {
        let mut i = self.find_index(key, strings)?;
        while i < self.array.len() {
            if !self.array[i].is_nil() {
                return Ok(Some((TValue::Int(i as i64 + 1), self.array[i])));
            }
            i += 1;
        }
        let mut i = i - self.array.len();
        while i < self.node.len() {
            let n = &self.node[i];
            if !n.val.is_nil() {
                return Ok(Some((n.key, n.val)));
            }
            i += 1;
        }
        Ok(None)
    }

    fn find_index(&self, key: TValue, strings: &StringInterner) -> Result<usize, LuaError> {
        let key = match key {
            TValue::Nil => return Ok(0),
            TValue::Float(f) => float_to_integer(f).map(TValue::Int).unwrap_or(key),
            k => k,
        };
        if let TValue::Int(k) = key {
            if k >= 1 && (k as u64) <= self.array.len() as u64 {
                return Ok(k as usize);
            }
        }
        if self.node.is_empty() {
            return Err(LuaError::InvalidNextKey);
        }
        let mut i = self.main_position(&key, strings);
        loop {
            let n = &self.node[i];
            // a dead key still matches by identity
            let found = if n.dead_key {
                key.is_collectable() && n.key.gc_ref() == key.gc_ref()
            } else {
                n.key.raw_equals(&key, strings)
            };
            if found {
                return Ok(i + 1 + self.array.len());
            }
            if n.next == 0 {
                return Err(LuaError::InvalidNextKey);
            }
            i = Self::step(i, n.next);
        }
    }
}

/// Reject nil and NaN keys and convert integral floats to integers.
pub fn normalize_key(key: TValue) -> Result<TValue, LuaError> {
    match key {
        TValue::Nil => Err(LuaError::NilIndex),
        TValue::Float(f) if f.is_nan() => Err(LuaError::NanIndex),
        TValue::Float(f) => Ok(float_to_integer(f).map(TValue::Int).unwrap_or(key)),
        k => Ok(k),
    }
}

fn node_vector(size: usize) -> Result<(u8, Vec<Node>), LuaError> {
    if size == 0 {
        return Ok((0, Vec::new()));
    }
    let lsize = ceil_log2(size as u64) as usize;
    if lsize > MAXHBITS {
        return Err(LuaError::TableOverflow);
    }
    Ok((lsize as u8, vec![Node::default(); 1 << lsize]))
}

fn ceil_log2(x: u64) -> u32 {
    debug_assert!(x > 0);
    if x <= 1 {
        0
    } else {
        64 - (x - 1).leading_zeros()
    }
}

fn array_index(key: &TValue) -> Option<u64> {
    match *key {
        TValue::Int(k) if k > 0 && (k as u64) <= MAXASIZE => Some(k as u64),
        _ => None,
    }
}

fn count_int(key: &TValue, nums: &mut [usize; MAXABITS + 1]) -> usize {
    match array_index(key) {
        Some(k) => {
            nums[ceil_log2(k) as usize] += 1;
            1
        }
        None => 0,
    }
}

/// Returns (optimal array size, number of keys that go to the array part).
fn compute_sizes(nums: &[usize; MAXABITS + 1], pna: usize) -> (usize, usize) {
    let mut a = 0;
    let mut na = 0;
    let mut optimal = 0;
    let mut twotoi = 1usize;
    for &count in nums.iter() {
        if pna <= twotoi / 2 {
            break;
        }
        if count > 0 {
            a += count;
            if a > twotoi / 2 {
                optimal = twotoi;
                na = a;
            }
        }
        twotoi *= 2;
    }
    (optimal, na)
}

/// Split a finite float into a mantissa in [0.5, 1) and an exponent.
fn frexp(x: f64) -> (f64, i32) {
    if x == 0.0 || !x.is_finite() {
        return (x, 0);
    }
    let bits = x.to_bits();
    let exp = ((bits >> 52) & 0x7ff) as i32;
    if exp == 0 {
        let (m, e) = frexp(x * f64::from_bits(0x4350_0000_0000_0000)); // 2^54
        return (m, e - 54);
    }
    let m = f64::from_bits((bits & !(0x7ffu64 << 52)) | (1022u64 << 52));
    (m, exp - 1022)
}

/// Hash for non-integral float keys. Infinities and NaN hash to 0.
fn hash_float(n: f64) -> u32 {
    let (m, e) = frexp(n);
    let n = m * 2_147_483_648.0;
    if !n.is_finite() {
        return 0;
    }
    let ni = n as i64;
    let u = (e as u32).wrapping_add(ni as u32);
    if u <= i32::MAX as u32 {
        u
    } else {
        !u
    }
}
