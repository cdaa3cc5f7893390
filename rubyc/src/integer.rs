/// The integer model of the target.
///
/// One mathematical domain, two representations:
///
/// ```text
///   fixnum   [-2^30, 2^30 - 1]   tagged word (n << 1) | 1
///   heap     sign + magnitude    [class, sign, limb count, limbs...] (32-bit limbs)
/// ```
///
/// Equality, ordering and arithmetic never depend on which representation
/// a value happens to be in. Results are demoted to fixnums whenever they
/// fit, which is also what the runtime's slow paths do. The compiler uses
/// this model for constant folding and to lay out heap literals.
use std::cmp::Ordering;

pub const FIXNUM_MIN: i64 = -(1 << 30);
pub const FIXNUM_MAX: i64 = (1 << 30) - 1;

/// Sign and little-endian 32-bit magnitude. `sign == 0` exactly when the
/// magnitude is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapInt {
    sign: i8,
    limbs: Vec<u32>,
}

#[derive(Debug, Clone)]
pub enum Integer {
    Fixnum(i32),
    Heap(HeapInt),
}

// ── Magnitudes ─────────────────────────────────────────────────────

fn normalize_len(limbs: &mut Vec<u32>) {
    while limbs.last() == Some(&0) {
        limbs.pop();
    }
}

fn cmp_mag(a: &[u32], b: &[u32]) -> Ordering {
    if a.len() != b.len() {
        return a.len().cmp(&b.len());
    }
    for i in (0..a.len()).rev() {
        if a[i] != b[i] {
            return a[i].cmp(&b[i]);
        }
    }
    Ordering::Equal
}

fn add_mag(a: &[u32], b: &[u32]) -> Vec<u32> {
    let len = a.len().max(b.len());
    let mut out = Vec::with_capacity(len + 1);
    let mut carry = 0u64;
    for i in 0..len {
        let sum = *a.get(i).unwrap_or(&0) as u64 + *b.get(i).unwrap_or(&0) as u64 + carry;
        out.push(sum as u32);
        carry = sum >> 32;
    }
    if carry != 0 {
        out.push(carry as u32);
    }
    out
}

/// `a - b` for `a >= b`.
fn sub_mag(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(a.len());
    let mut borrow = 0i64;
    for i in 0..a.len() {
        let mut diff = a[i] as i64 - *b.get(i).unwrap_or(&0) as i64 - borrow;
        borrow = 0;
        if diff < 0 {
            diff += 1 << 32;
            borrow = 1;
        }
        out.push(diff as u32);
    }
    normalize_len(&mut out);
    out
}

fn mul_mag(a: &[u32], b: &[u32]) -> Vec<u32> {
    if a.is_empty() || b.is_empty() {
        return Vec::new();
    }
    let mut out = vec![0u32; a.len() + b.len()];
    for (i, &x) in a.iter().enumerate() {
        let mut carry = 0u64;
        for (j, &y) in b.iter().enumerate() {
            let acc = out[i + j] as u64 + x as u64 * y as u64 + carry;
            out[i + j] = acc as u32;
            carry = acc >> 32;
        }
        out[i + b.len()] = carry as u32;
    }
    normalize_len(&mut out);
    out
}

/// Divide in place by a small divisor, returning the remainder.
fn div_small(limbs: &mut Vec<u32>, divisor: u32) -> u32 {
    let mut rem = 0u64;
    for limb in limbs.iter_mut().rev() {
        let cur = (rem << 32) | *limb as u64;
        *limb = (cur / divisor as u64) as u32;
        rem = cur % divisor as u64;
    }
    normalize_len(limbs);
    rem as u32
}

fn mul_small_add(limbs: &mut Vec<u32>, factor: u32, add: u32) {
    let mut carry = add as u64;
    for limb in limbs.iter_mut() {
        let acc = *limb as u64 * factor as u64 + carry;
        *limb = acc as u32;
        carry = acc >> 32;
    }
    if carry != 0 {
        limbs.push(carry as u32);
    }
}

// ── HeapInt ────────────────────────────────────────────────────────

impl HeapInt {
    fn new(sign: i8, mut limbs: Vec<u32>) -> Self {
        normalize_len(&mut limbs);
        let sign = if limbs.is_empty() { 0 } else { sign };
        Self { sign, limbs }
    }

    pub fn from_i64(value: i64) -> Self {
        Self::from_i128(value as i128)
    }

    fn from_i128(value: i128) -> Self {
        let sign = value.signum() as i8;
        let mut mag = value.unsigned_abs();
        let mut limbs = Vec::new();
        while mag != 0 {
            limbs.push(mag as u32);
            mag >>= 32;
        }
        Self::new(sign, limbs)
    }

    pub fn sign(&self) -> i8 {
        self.sign
    }

    pub fn limbs(&self) -> &[u32] {
        &self.limbs
    }

    fn to_i128(&self) -> Option<i128> {
        if self.limbs.len() > 4 {
            return None;
        }
        let mut mag: u128 = 0;
        for &limb in self.limbs.iter().rev() {
            mag = (mag << 32) | limb as u128;
        }
        let mag = i128::try_from(mag).ok()?;
        Some(mag * self.sign as i128)
    }

    fn negated(&self) -> Self {
        Self {
            sign: -self.sign,
            limbs: self.limbs.clone(),
        }
    }

    fn add(&self, other: &HeapInt) -> HeapInt {
        if self.sign == 0 {
            return other.clone();
        }
        if other.sign == 0 {
            return self.clone();
        }
        if self.sign == other.sign {
            return HeapInt::new(self.sign, add_mag(&self.limbs, &other.limbs));
        }
        match cmp_mag(&self.limbs, &other.limbs) {
            Ordering::Greater => HeapInt::new(self.sign, sub_mag(&self.limbs, &other.limbs)),
            Ordering::Less => HeapInt::new(other.sign, sub_mag(&other.limbs, &self.limbs)),
            Ordering::Equal => HeapInt::new(0, Vec::new()),
        }
    }

    fn mul(&self, other: &HeapInt) -> HeapInt {
        HeapInt::new(self.sign * other.sign, mul_mag(&self.limbs, &other.limbs))
    }

    fn cmp_value(&self, other: &HeapInt) -> Ordering {
        if self.sign != other.sign {
            return self.sign.cmp(&other.sign);
        }
        let mag = cmp_mag(&self.limbs, &other.limbs);
        if self.sign < 0 { mag.reverse() } else { mag }
    }
}

// ── Integer ────────────────────────────────────────────────────────

impl Integer {
    /// The value in its canonical representation.
    pub fn from_i64(value: i64) -> Self {
        if (FIXNUM_MIN..=FIXNUM_MAX).contains(&value) {
            Integer::Fixnum(value as i32)
        } else {
            Integer::Heap(HeapInt::from_i64(value))
        }
    }

    /// The value boxed on the heap even when it would fit a fixnum.
    pub fn heap(value: i64) -> Self {
        Integer::Heap(HeapInt::from_i64(value))
    }

    /// Decimal text with an optional leading `-`. Underscores are allowed
    /// between digits.
    pub fn parse(text: &str) -> Option<Self> {
        let (sign, digits) = match text.strip_prefix('-') {
            Some(rest) => (-1, rest),
            None => (1, text),
        };
        if digits.is_empty() {
            return None;
        }
        let mut limbs = Vec::new();
        let mut seen = false;
        for c in digits.chars() {
            match c {
                '_' => continue,
                '0'..='9' => {
                    mul_small_add(&mut limbs, 10, c as u32 - '0' as u32);
                    seen = true;
                }
                _ => return None,
            }
        }
        if !seen {
            return None;
        }
        Some(Integer::Heap(HeapInt::new(sign, limbs)).demoted())
    }

    /// Fixnum when the value fits, heap otherwise.
    pub fn demoted(self) -> Self {
        let small = match &self {
            Integer::Fixnum(_) => None,
            Integer::Heap(h) => h
                .to_i128()
                .filter(|v| (FIXNUM_MIN as i128..=FIXNUM_MAX as i128).contains(v)),
        };
        match small {
            Some(v) => Integer::Fixnum(v as i32),
            None => self,
        }
    }

    pub fn is_fixnum(&self) -> bool {
        matches!(self, Integer::Fixnum(_))
    }

    /// The tagged machine word of a fixnum.
    pub fn tagged(&self) -> Option<u32> {
        match self {
            Integer::Fixnum(n) => Some(((*n as u32) << 1) | 1),
            Integer::Heap(_) => None,
        }
    }

    pub fn to_i64(&self) -> Option<i64> {
        self.to_i128().and_then(|v| i64::try_from(v).ok())
    }

    pub fn to_i128(&self) -> Option<i128> {
        match self {
            Integer::Fixnum(n) => Some(*n as i128),
            Integer::Heap(h) => h.to_i128(),
        }
    }

    fn as_heap(&self) -> HeapInt {
        match self {
            Integer::Fixnum(n) => HeapInt::from_i64(*n as i64),
            Integer::Heap(h) => h.clone(),
        }
    }

    /// Sign and magnitude for a heap literal.
    pub fn heap_words(&self) -> (i8, Vec<u32>) {
        let h = self.as_heap();
        (h.sign, h.limbs)
    }

    fn from_heap(h: HeapInt) -> Integer {
        Integer::Heap(h).demoted()
    }
}

impl PartialEq for Integer {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Integer {}

impl PartialOrd for Integer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Integer {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Integer::Fixnum(a), Integer::Fixnum(b)) => a.cmp(b),
            _ => self.as_heap().cmp_value(&other.as_heap()),
        }
    }
}

impl std::ops::Add for &Integer {
    type Output = Integer;

    fn add(self, rhs: &Integer) -> Integer {
        match (self, rhs) {
            (Integer::Fixnum(a), Integer::Fixnum(b)) => Integer::from_i64(*a as i64 + *b as i64),
            _ => Integer::from_heap(self.as_heap().add(&rhs.as_heap())),
        }
    }
}

impl std::ops::Sub for &Integer {
    type Output = Integer;

    fn sub(self, rhs: &Integer) -> Integer {
        match (self, rhs) {
            (Integer::Fixnum(a), Integer::Fixnum(b)) => Integer::from_i64(*a as i64 - *b as i64),
            _ => Integer::from_heap(self.as_heap().add(&rhs.as_heap().negated())),
        }
    }
}

impl std::ops::Mul for &Integer {
    type Output = Integer;

    fn mul(self, rhs: &Integer) -> Integer {
        match (self, rhs) {
            (Integer::Fixnum(a), Integer::Fixnum(b)) => Integer::from_i64(*a as i64 * *b as i64),
            _ => Integer::from_heap(self.as_heap().mul(&rhs.as_heap())),
        }
    }
}

impl std::ops::Neg for &Integer {
    type Output = Integer;

    fn neg(self) -> Integer {
        match self {
            Integer::Fixnum(n) => Integer::from_i64(-(*n as i64)),
            Integer::Heap(h) => Integer::from_heap(h.negated()),
        }
    }
}

impl std::fmt::Display for Integer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let h = match self {
            Integer::Fixnum(n) => return write!(f, "{n}"),
            Integer::Heap(h) => h,
        };
        if h.sign == 0 {
            return write!(f, "0");
        }
        let mut limbs = h.limbs.clone();
        let mut chunks = Vec::new();
        while !limbs.is_empty() {
            chunks.push(div_small(&mut limbs, 1_000_000_000));
        }
        if h.sign < 0 {
            write!(f, "-")?;
        }
        let mut iter = chunks.iter().rev();
        if let Some(first) = iter.next() {
            write!(f, "{first}")?;
        }
        for chunk in iter {
            write!(f, "{chunk:09}")?;
        }
        Ok(())
    }
}
