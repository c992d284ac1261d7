#![forbid(unsafe_code)]
//! The unique-naming engine.
//!
//! Source names are transliterated into a target charset, trimmed to the
//! target length discipline, disambiguated with numeric variants within
//! their directory, and decorated with the filesystem-required parts
//! (extension dot, ISO-9660 `;1` version). Ordering of the results is
//! hierarchy-aware: names compare segment by segment between separators so
//! that extension and version boundaries sort the way directory readers
//! expect.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::cmp::Ordering;
use std::collections::BTreeMap;

mod decompose;
pub use decompose::{decompose_european, decompose_hangul, AppleDecompose};

/// Replacement characters per target charset.
pub const UNCHAR_UCS2: char = '\u{fffd}';
pub const UNCHAR_CDFS: char = '_';

// ── Hierarchy-aware comparison ──────────────────────────────────────────────

/// A converted name plus the character positions of its `.` and `;`
/// separators, ordered by the hierarchy-aware rule:
/// `ab.k < abc.0 < abc.01 < abc.1 < abc$ < ac < b`.
#[derive(Debug, Clone)]
pub struct Delimited {
    pub conv: Vec<char>,
    pub seps: Vec<usize>,
}

impl PartialEq for Delimited {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Delimited {}

impl Delimited {
    #[must_use]
    pub fn text(&self) -> String {
        self.conv.iter().collect()
    }

    /// Position of separator `index`, or the end of the name.
    #[must_use]
    pub fn sep(&self, index: usize) -> usize {
        self.seps.get(index).copied().unwrap_or(self.conv.len())
    }

    /// The characters of segment `index`, or `None` past the last segment.
    fn segment(&self, index: usize) -> Option<&[char]> {
        let start = if index == 0 {
            0
        } else {
            self.seps.get(index - 1).copied()? + 1
        };
        let end = self.sep(index);
        if start > self.conv.len() {
            return None;
        }
        Some(&self.conv[start..end.min(self.conv.len())])
    }
}

impl Ord for Delimited {
    fn cmp(&self, other: &Self) -> Ordering {
        let mut index = 0;
        loop {
            match (self.segment(index), other.segment(index)) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(left), Some(right)) => {
                    // a missing character is a sentinel below every real one
                    for at in 0..left.len().max(right.len()) {
                        match (left.get(at), right.get(at)) {
                            (None, None) => {}
                            (None, Some(_)) => return Ordering::Less,
                            (Some(_), None) => return Ordering::Greater,
                            (Some(lc), Some(rc)) => match lc.cmp(rc) {
                                Ordering::Equal => {}
                                unequal => return unequal,
                            },
                        }
                    }
                }
            }
            index += 1;
        }
    }
}

impl PartialOrd for Delimited {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ── Name rules ──────────────────────────────────────────────────────────────

/// Force an ISO-9660 D-character: `A-Z 0-9 _`, lowercase uppercased,
/// everything else replaced.
#[must_use]
pub fn ensure_d(c: char) -> char {
    match c {
        'a'..='z' => c.to_ascii_uppercase(),
        'A'..='Z' | '0'..='9' => c,
        _ => UNCHAR_CDFS,
    }
}

/// Force a Joliet-admissible UCS-2 code point: control characters and
/// `* / \ : ; ?` are replaced, everything else passes.
#[must_use]
pub fn ensure_d1(c: char) -> char {
    if (c as u32) < 0x20 || matches!(c, '*' | '/' | '\\' | ':' | ';' | '?') {
        UNCHAR_UCS2
    } else {
        c
    }
}

/// A name-variation rule: charset, segment sizes and decoration discipline
/// for one target filesystem. Stateless; owns nothing.
#[derive(Clone, Copy)]
pub struct NameRule {
    /// Per-character transliteration.
    pub spay: fn(char) -> char,
    /// Base segment limit in characters.
    pub base_len: usize,
    /// Extension limit in characters.
    pub ext_len: usize,
    /// Append a dot to files even without an extension.
    pub force_dot: bool,
    /// ISO-9660 file version appended after `;`, zero for none.
    pub version: u16,
}

impl NameRule {
    /// ISO-9660 level-2 names for the primary volume: 24+5 D-characters,
    /// `;1` version.
    #[must_use]
    pub fn primary_volume() -> Self {
        Self {
            spay: ensure_d,
            base_len: 24,
            ext_len: 5,
            force_dot: true,
            version: 1,
        }
    }

    /// Joliet names for the supplementary volume: UCS-2, 54+5 characters.
    #[must_use]
    pub fn joliet_volume() -> Self {
        Self {
            spay: ensure_d1,
            base_len: 54,
            ext_len: 5,
            force_dot: false,
            version: 1,
        }
    }

    /// MS-DOS 8.3 with a forced dot.
    #[must_use]
    pub fn dos_volume() -> Self {
        Self {
            spay: ensure_d,
            base_len: 8,
            ext_len: 3,
            force_dot: true,
            version: 0,
        }
    }

    /// FAT 8.3: no forced dot, no version.
    #[must_use]
    pub fn fat_volume() -> Self {
        Self {
            spay: ensure_d,
            base_len: 8,
            ext_len: 3,
            force_dot: false,
            version: 0,
        }
    }

    /// Apply the rule at variant 0 without a pool: transliterate, trim,
    /// decorate. Collisions are the pool's business.
    #[must_use]
    pub fn apply(&self, original: &str, is_file: bool) -> Delimited {
        let mut name = WorkName::start(original, is_file, self);
        name.mix_in_variant(0, self);
        name.decorate(self);
        Delimited {
            conv: name.conv,
            seps: name.seps,
        }
    }
}

/// Scratch state for one name being fitted.
struct WorkName {
    /// Transliterated characters of the full original name.
    tran: Vec<char>,
    /// Character count of the base part (before the recognized extension).
    link_len: usize,
    conv: Vec<char>,
    seps: Vec<usize>,
    is_file: bool,
}

impl WorkName {
    fn start(original: &str, is_file: bool, rule: &NameRule) -> Self {
        let chars: Vec<char> = original.chars().collect();
        let size = chars.len();
        // recognize an extension only if the final dot is close enough to
        // the end to fit the extension budget
        let dot = if is_file {
            chars.iter().rposition(|&c| c == '.')
        } else {
            None
        };
        let link_len = match dot {
            Some(pos) if size <= rule.ext_len + 1 || pos >= size - rule.ext_len - 1 => pos,
            _ => size,
        };
        let tran = chars.into_iter().map(rule.spay).collect();
        Self {
            tran,
            link_len,
            conv: Vec::new(),
            seps: Vec::new(),
            is_file,
        }
    }

    /// Rebuild `conv` as the trimmed base with the variant digits mixed in.
    fn mix_in_variant(&mut self, variant: u32, rule: &NameRule) {
        let digits: Vec<char> = if variant == 0 {
            Vec::new()
        } else {
            variant.to_string().chars().collect()
        };
        let base = self
            .link_len
            .min(rule.base_len.saturating_sub(digits.len()));
        self.conv.clear();
        self.seps.clear();
        self.conv.extend_from_slice(&self.tran[..base]);
        self.conv.extend_from_slice(&digits);
    }

    /// Reinsert the extension and the filesystem-required suffixes.
    fn decorate(&mut self, rule: &NameRule) {
        let has_ext = self.tran.len() > self.link_len;
        let add_dot = (rule.force_dot && self.is_file) || has_ext;
        if add_dot {
            self.seps.push(self.conv.len());
            self.conv.push('.');
        }
        if has_ext {
            let ext_start = self.link_len + 1;
            let ext_end = self.tran.len().min(ext_start + rule.ext_len);
            self.conv.extend_from_slice(&self.tran[ext_start..ext_end]);
        }
        if rule.version != 0 && self.is_file {
            self.seps.push(self.conv.len());
            self.conv.push(';');
            self.conv.extend(rule.version.to_string().chars());
        }
    }
}

// ── Variant generation ──────────────────────────────────────────────────────

/// Produces the numeric suffix probed at a given retry attempt.
pub trait Variant {
    fn variant(&mut self, attempt: u32) -> u32;
}

/// The legacy generator: attempt 0 is the bare name, attempt `k` mixes in
/// `k + (rng % k²)`.
pub struct LegacyRand {
    rng: SmallRng,
}

impl LegacyRand {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
        }
    }
}

impl Variant for LegacyRand {
    fn variant(&mut self, attempt: u32) -> u32 {
        if attempt == 0 {
            0
        } else {
            attempt + self.rng.gen_range(0..attempt.saturating_mul(attempt).max(1))
        }
    }
}

// ── Name pool ───────────────────────────────────────────────────────────────

/// Per-directory canonicalization state: distinct source names map to
/// unique compliant target names; identical source names reuse their
/// earlier conversion. Stateless across directories — every directory pass
/// starts a fresh pool, so equal inputs give equal outputs.
#[derive(Default)]
pub struct NamePool {
    /// transliterated form -> (original source name, converted result)
    by_translit: BTreeMap<String, (String, Delimited)>,
    /// decorated converted forms already taken in this directory
    taken: BTreeMap<String, ()>,
}

impl NamePool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonicalize one source name.
    pub fn fit_name(
        &mut self,
        original: &str,
        is_file: bool,
        rule: &NameRule,
        variants: &mut dyn Variant,
    ) -> Delimited {
        let mut work = WorkName::start(original, is_file, rule);
        let translit: String = work.tran.iter().collect();

        if let Some((earlier, conv)) = self.by_translit.get(&translit) {
            if earlier == original {
                return conv.clone();
            }
        }

        let mut attempt = 0_u32;
        loop {
            work.mix_in_variant(variants.variant(attempt), rule);
            work.decorate(rule);
            let decorated: String = work.conv.iter().collect();
            if !self.taken.contains_key(&decorated) {
                let out = Delimited {
                    conv: std::mem::take(&mut work.conv),
                    seps: std::mem::take(&mut work.seps),
                };
                self.taken.insert(decorated, ());
                self.by_translit
                    .entry(translit)
                    .or_insert((original.to_string(), out.clone()));
                return out;
            }
            attempt += 1;
        }
    }
}

// ── Charset packs ───────────────────────────────────────────────────────────

/// Pack characters as single bytes (code points above 0xFF degrade to `?`).
#[must_use]
pub fn pack_ansi(chars: &[char]) -> Vec<u8> {
    chars
        .iter()
        .map(|&c| {
            let cp = c as u32;
            if cp <= 0xff {
                cp as u8
            } else {
                b'?'
            }
        })
        .collect()
}

/// Pack characters as UCS-2 big-endian (Joliet).
#[must_use]
pub fn pack_ucs2_be(chars: &[char]) -> Vec<u8> {
    let mut out = Vec::with_capacity(chars.len() * 2);
    for &c in chars {
        let unit = ucs2_unit(c);
        out.extend_from_slice(&unit.to_be_bytes());
    }
    out
}

/// Pack characters as UCS-2 little-endian (FAT long names).
#[must_use]
pub fn pack_ucs2_le(chars: &[char]) -> Vec<u8> {
    let mut out = Vec::with_capacity(chars.len() * 2);
    for &c in chars {
        let unit = ucs2_unit(c);
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

fn ucs2_unit(c: char) -> u16 {
    let cp = c as u32;
    if cp <= 0xffff {
        cp as u16
    } else {
        UNCHAR_UCS2 as u16
    }
}

/// Sanitize an identifier to D-characters, as volume titles require.
#[must_use]
pub fn sanitize_d(text: &str) -> String {
    text.chars().map(ensure_d).collect()
}

/// CRC-32/CKSUM of a label, used to derive the FAT volume serial.
#[must_use]
pub fn label_crc32(label: &str) -> u32 {
    const CKSUM: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_CKSUM);
    CKSUM.checksum(label.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delim(text: &str) -> Delimited {
        let conv: Vec<char> = text.chars().collect();
        let seps = conv
            .iter()
            .enumerate()
            .filter(|(_, &c)| c == '.' || c == ';')
            .map(|(i, _)| i)
            .collect();
        Delimited { conv, seps }
    }

    #[test]
    fn hierarchy_order_matches_the_contract() {
        let expected = ["ab.k", "abc.0", "abc.01", "abc.1", "abc$", "ac", "b"];
        let mut shuffled: Vec<Delimited> = expected.iter().rev().map(|t| delim(t)).collect();
        shuffled.sort();
        let sorted: Vec<String> = shuffled.iter().map(Delimited::text).collect();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn bare_name_sorts_before_decorated() {
        assert!(delim("abc") < delim("abc.0"));
        assert!(delim("abc.") < delim("abc.0"));
    }

    #[test]
    fn primary_volume_rule_decorates_with_version() {
        let rule = NameRule::primary_volume();
        let name = rule.apply("hello.txt", true);
        assert_eq!(name.text(), "HELLO.TXT;1");
        assert_eq!(name.seps, vec![5, 9]);
    }

    #[test]
    fn extensionless_file_still_gets_the_dot_on_iso() {
        let rule = NameRule::primary_volume();
        assert_eq!(rule.apply("README", true).text(), "README.;1");
        // folders never get decorations
        assert_eq!(rule.apply("README", false).text(), "README");
    }

    #[test]
    fn overlong_extension_is_not_an_extension() {
        let rule = NameRule::dos_volume();
        // the final dot is too far from the end for a 3-char extension, so
        // the whole name is base; the dot transliterates away
        let name = rule.apply("archive.backup", true);
        assert_eq!(name.text(), "ARCHIVE_.");
    }

    #[test]
    fn fat_rule_round_trips_plain_dos_names() {
        let rule = NameRule::fat_volume();
        assert_eq!(rule.apply("A.TXT", true).text(), "A.TXT");
        assert_eq!(rule.apply("readme.txt", true).text(), "README.TXT");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let d = NameRule::dos_volume();
        let fit = d.apply("SOME.TXT", true).text();
        assert_eq!(d.apply(&fit, true).text(), fit);

        let f = NameRule::fat_volume();
        let once = f.apply("Mixed Case Name.tar", true).text();
        assert_eq!(f.apply(&once, true).text(), once);
    }

    #[test]
    fn pool_reuses_identical_sources_and_disambiguates_collisions() {
        let rule = NameRule::dos_volume();
        let mut pool = NamePool::new();
        let mut variants = LegacyRand::new(1);

        let first = pool.fit_name("a+b.txt", true, &rule, &mut variants);
        let again = pool.fit_name("a+b.txt", true, &rule, &mut variants);
        assert_eq!(first, again);
        assert_eq!(first.text(), "A_B.TXT");

        // a different source transliterating to the same form must diverge
        let clash = pool.fit_name("a-b.txt", true, &rule, &mut variants);
        assert_ne!(first.text(), clash.text());
        assert!(clash.text().ends_with(".TXT"));
    }

    #[test]
    fn pool_uniqueness_under_mass_collision() {
        let rule = NameRule::dos_volume();
        let mut pool = NamePool::new();
        let mut variants = LegacyRand::new(7);
        let mut seen = std::collections::BTreeSet::new();
        for i in 0..64 {
            let name = format!("very long colliding name {i}.txt");
            let fitted = pool.fit_name(&name, true, &rule, &mut variants).text();
            assert!(seen.insert(fitted), "duplicate emitted");
        }
    }

    #[test]
    fn packs() {
        let chars: Vec<char> = "Aé".chars().collect();
        assert_eq!(pack_ansi(&chars), vec![0x41, 0xe9]);
        assert_eq!(pack_ucs2_be(&chars), vec![0x00, 0x41, 0x00, 0xe9]);
        assert_eq!(pack_ucs2_le(&chars), vec![0x41, 0x00, 0xe9, 0x00]);
    }

    #[test]
    fn label_crc_is_stable() {
        assert_eq!(label_crc32("MEDIA"), label_crc32("MEDIA"));
        assert_ne!(label_crc32("MEDIA"), label_crc32("MEDIB"));
    }
}
