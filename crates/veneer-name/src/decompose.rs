//! Apple-canonical Unicode decomposition for HFS+ catalog names.
//!
//! HFS+ stores names in a canonically decomposed form (the Apple variant of
//! NFD). Two producers matter for the sources this tool sees: precomposed
//! Central European Latin letters, handled by table, and Korean Hangul
//! syllables, handled algorithmically.

/// Precomposed Latin letters of the Latin-1 Supplement and Latin Extended-A
/// blocks with their canonical base + combining-mark decompositions.
/// Letters without a canonical decomposition (Æ, Ø, ß, Đ, Ł, ...) are absent
/// on purpose.
const EUROPEAN: &[(char, &[char])] = &[
    ('\u{c0}', &['A', '\u{300}']),
    ('\u{c1}', &['A', '\u{301}']),
    ('\u{c2}', &['A', '\u{302}']),
    ('\u{c3}', &['A', '\u{303}']),
    ('\u{c4}', &['A', '\u{308}']),
    ('\u{c5}', &['A', '\u{30a}']),
    ('\u{c7}', &['C', '\u{327}']),
    ('\u{c8}', &['E', '\u{300}']),
    ('\u{c9}', &['E', '\u{301}']),
    ('\u{ca}', &['E', '\u{302}']),
    ('\u{cb}', &['E', '\u{308}']),
    ('\u{cc}', &['I', '\u{300}']),
    ('\u{cd}', &['I', '\u{301}']),
    ('\u{ce}', &['I', '\u{302}']),
    ('\u{cf}', &['I', '\u{308}']),
    ('\u{d1}', &['N', '\u{303}']),
    ('\u{d2}', &['O', '\u{300}']),
    ('\u{d3}', &['O', '\u{301}']),
    ('\u{d4}', &['O', '\u{302}']),
    ('\u{d5}', &['O', '\u{303}']),
    ('\u{d6}', &['O', '\u{308}']),
    ('\u{d9}', &['U', '\u{300}']),
    ('\u{da}', &['U', '\u{301}']),
    ('\u{db}', &['U', '\u{302}']),
    ('\u{dc}', &['U', '\u{308}']),
    ('\u{dd}', &['Y', '\u{301}']),
    ('\u{e0}', &['a', '\u{300}']),
    ('\u{e1}', &['a', '\u{301}']),
    ('\u{e2}', &['a', '\u{302}']),
    ('\u{e3}', &['a', '\u{303}']),
    ('\u{e4}', &['a', '\u{308}']),
    ('\u{e5}', &['a', '\u{30a}']),
    ('\u{e7}', &['c', '\u{327}']),
    ('\u{e8}', &['e', '\u{300}']),
    ('\u{e9}', &['e', '\u{301}']),
    ('\u{ea}', &['e', '\u{302}']),
    ('\u{eb}', &['e', '\u{308}']),
    ('\u{ec}', &['i', '\u{300}']),
    ('\u{ed}', &['i', '\u{301}']),
    ('\u{ee}', &['i', '\u{302}']),
    ('\u{ef}', &['i', '\u{308}']),
    ('\u{f1}', &['n', '\u{303}']),
    ('\u{f2}', &['o', '\u{300}']),
    ('\u{f3}', &['o', '\u{301}']),
    ('\u{f4}', &['o', '\u{302}']),
    ('\u{f5}', &['o', '\u{303}']),
    ('\u{f6}', &['o', '\u{308}']),
    ('\u{f9}', &['u', '\u{300}']),
    ('\u{fa}', &['u', '\u{301}']),
    ('\u{fb}', &['u', '\u{302}']),
    ('\u{fc}', &['u', '\u{308}']),
    ('\u{fd}', &['y', '\u{301}']),
    ('\u{ff}', &['y', '\u{308}']),
    ('\u{100}', &['A', '\u{304}']),
    ('\u{101}', &['a', '\u{304}']),
    ('\u{102}', &['A', '\u{306}']),
    ('\u{103}', &['a', '\u{306}']),
    ('\u{104}', &['A', '\u{328}']),
    ('\u{105}', &['a', '\u{328}']),
    ('\u{106}', &['C', '\u{301}']),
    ('\u{107}', &['c', '\u{301}']),
    ('\u{108}', &['C', '\u{302}']),
    ('\u{109}', &['c', '\u{302}']),
    ('\u{10a}', &['C', '\u{307}']),
    ('\u{10b}', &['c', '\u{307}']),
    ('\u{10c}', &['C', '\u{30c}']),
    ('\u{10d}', &['c', '\u{30c}']),
    ('\u{10e}', &['D', '\u{30c}']),
    ('\u{10f}', &['d', '\u{30c}']),
    ('\u{112}', &['E', '\u{304}']),
    ('\u{113}', &['e', '\u{304}']),
    ('\u{114}', &['E', '\u{306}']),
    ('\u{115}', &['e', '\u{306}']),
    ('\u{116}', &['E', '\u{307}']),
    ('\u{117}', &['e', '\u{307}']),
    ('\u{118}', &['E', '\u{328}']),
    ('\u{119}', &['e', '\u{328}']),
    ('\u{11a}', &['E', '\u{30c}']),
    ('\u{11b}', &['e', '\u{30c}']),
    ('\u{11c}', &['G', '\u{302}']),
    ('\u{11d}', &['g', '\u{302}']),
    ('\u{11e}', &['G', '\u{306}']),
    ('\u{11f}', &['g', '\u{306}']),
    ('\u{120}', &['G', '\u{307}']),
    ('\u{121}', &['g', '\u{307}']),
    ('\u{122}', &['G', '\u{327}']),
    ('\u{123}', &['g', '\u{327}']),
    ('\u{124}', &['H', '\u{302}']),
    ('\u{125}', &['h', '\u{302}']),
    ('\u{128}', &['I', '\u{303}']),
    ('\u{129}', &['i', '\u{303}']),
    ('\u{12a}', &['I', '\u{304}']),
    ('\u{12b}', &['i', '\u{304}']),
    ('\u{12c}', &['I', '\u{306}']),
    ('\u{12d}', &['i', '\u{306}']),
    ('\u{12e}', &['I', '\u{328}']),
    ('\u{12f}', &['i', '\u{328}']),
    ('\u{130}', &['I', '\u{307}']),
    ('\u{134}', &['J', '\u{302}']),
    ('\u{135}', &['j', '\u{302}']),
    ('\u{136}', &['K', '\u{327}']),
    ('\u{137}', &['k', '\u{327}']),
    ('\u{139}', &['L', '\u{301}']),
    ('\u{13a}', &['l', '\u{301}']),
    ('\u{13b}', &['L', '\u{327}']),
    ('\u{13c}', &['l', '\u{327}']),
    ('\u{13d}', &['L', '\u{30c}']),
    ('\u{13e}', &['l', '\u{30c}']),
    ('\u{143}', &['N', '\u{301}']),
    ('\u{144}', &['n', '\u{301}']),
    ('\u{145}', &['N', '\u{327}']),
    ('\u{146}', &['n', '\u{327}']),
    ('\u{147}', &['N', '\u{30c}']),
    ('\u{148}', &['n', '\u{30c}']),
    ('\u{14c}', &['O', '\u{304}']),
    ('\u{14d}', &['o', '\u{304}']),
    ('\u{14e}', &['O', '\u{306}']),
    ('\u{14f}', &['o', '\u{306}']),
    ('\u{150}', &['O', '\u{30b}']),
    ('\u{151}', &['o', '\u{30b}']),
    ('\u{154}', &['R', '\u{301}']),
    ('\u{155}', &['r', '\u{301}']),
    ('\u{156}', &['R', '\u{327}']),
    ('\u{157}', &['r', '\u{327}']),
    ('\u{158}', &['R', '\u{30c}']),
    ('\u{159}', &['r', '\u{30c}']),
    ('\u{15a}', &['S', '\u{301}']),
    ('\u{15b}', &['s', '\u{301}']),
    ('\u{15c}', &['S', '\u{302}']),
    ('\u{15d}', &['s', '\u{302}']),
    ('\u{15e}', &['S', '\u{327}']),
    ('\u{15f}', &['s', '\u{327}']),
    ('\u{160}', &['S', '\u{30c}']),
    ('\u{161}', &['s', '\u{30c}']),
    ('\u{162}', &['T', '\u{327}']),
    ('\u{163}', &['t', '\u{327}']),
    ('\u{164}', &['T', '\u{30c}']),
    ('\u{165}', &['t', '\u{30c}']),
    ('\u{168}', &['U', '\u{303}']),
    ('\u{169}', &['u', '\u{303}']),
    ('\u{16a}', &['U', '\u{304}']),
    ('\u{16b}', &['u', '\u{304}']),
    ('\u{16c}', &['U', '\u{306}']),
    ('\u{16d}', &['u', '\u{306}']),
    ('\u{16e}', &['U', '\u{30a}']),
    ('\u{16f}', &['u', '\u{30a}']),
    ('\u{170}', &['U', '\u{30b}']),
    ('\u{171}', &['u', '\u{30b}']),
    ('\u{172}', &['U', '\u{328}']),
    ('\u{173}', &['u', '\u{328}']),
    ('\u{174}', &['W', '\u{302}']),
    ('\u{175}', &['w', '\u{302}']),
    ('\u{176}', &['Y', '\u{302}']),
    ('\u{177}', &['y', '\u{302}']),
    ('\u{178}', &['Y', '\u{308}']),
    ('\u{179}', &['Z', '\u{301}']),
    ('\u{17a}', &['z', '\u{301}']),
    ('\u{17b}', &['Z', '\u{307}']),
    ('\u{17c}', &['z', '\u{307}']),
    ('\u{17d}', &['Z', '\u{30c}']),
    ('\u{17e}', &['z', '\u{30c}']),
];

fn european_lookup(c: char) -> Option<&'static [char]> {
    EUROPEAN
        .binary_search_by_key(&c, |&(key, _)| key)
        .ok()
        .map(|at| EUROPEAN[at].1)
}

/// Decompose one precomposed European letter, or `None` if it is already
/// canonical.
#[must_use]
pub fn decompose_european(c: char) -> Option<&'static [char]> {
    european_lookup(c)
}

const HANGUL_S_BASE: u32 = 0xac00;
const HANGUL_L_BASE: u32 = 0x1100;
const HANGUL_V_BASE: u32 = 0x1161;
const HANGUL_T_BASE: u32 = 0x11a7;
const HANGUL_V_COUNT: u32 = 21;
const HANGUL_T_COUNT: u32 = 28;
const HANGUL_S_COUNT: u32 = 11172;

/// Decompose one Hangul syllable into its jamo, or `None` for anything that
/// is not a precomposed syllable.
#[must_use]
pub fn decompose_hangul(c: char) -> Option<Vec<char>> {
    let cp = c as u32;
    if !(HANGUL_S_BASE..HANGUL_S_BASE + HANGUL_S_COUNT).contains(&cp) {
        return None;
    }
    let index = cp - HANGUL_S_BASE;
    let lead = HANGUL_L_BASE + index / (HANGUL_V_COUNT * HANGUL_T_COUNT);
    let vowel = HANGUL_V_BASE + (index % (HANGUL_V_COUNT * HANGUL_T_COUNT)) / HANGUL_T_COUNT;
    let trail = index % HANGUL_T_COUNT;
    let jamo = |cp: u32| char::from_u32(cp).unwrap_or('\u{fffd}');
    let mut out = vec![jamo(lead), jamo(vowel)];
    if trail != 0 {
        out.push(jamo(HANGUL_T_BASE + trail));
    }
    Some(out)
}

/// The composed corrector applied to every HFS+ catalog name.
#[derive(Default)]
pub struct AppleDecompose;

impl AppleDecompose {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Whether `name` contains anything the catalog form would change.
    #[must_use]
    pub fn irregular(&self, name: &str) -> bool {
        name.chars()
            .any(|c| european_lookup(c).is_some() || decompose_hangul(c).is_some())
    }

    /// Rewrite `name` into its Apple-canonical decomposed form.
    #[must_use]
    pub fn correct(&self, name: &str) -> String {
        if !self.irregular(name) {
            return name.to_string();
        }
        let mut out = String::with_capacity(name.len() * 2);
        for c in name.chars() {
            if let Some(expansion) = european_lookup(c) {
                out.extend(expansion.iter());
            } else if let Some(jamo) = decompose_hangul(c) {
                out.extend(jamo.iter());
            } else {
                out.push(c);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted_for_binary_search() {
        for pair in EUROPEAN.windows(2) {
            assert!(pair[0].0 < pair[1].0, "{:?} out of order", pair[1].0);
        }
    }

    #[test]
    fn cafe_decomposes() {
        let deco = AppleDecompose::new();
        assert_eq!(deco.correct("Café.txt"), "Cafe\u{301}.txt");
        assert!(deco.irregular("Café.txt"));
        assert!(!deco.irregular("Cafe.txt"));
    }

    #[test]
    fn hangul_round_trip_structure() {
        // U+D55C (한) = HIEUH + A + NIEUN
        let jamo = decompose_hangul('\u{d55c}').unwrap();
        assert_eq!(jamo, vec!['\u{1112}', '\u{1161}', '\u{11ab}']);
        // open syllable has no trailing jamo
        let open = decompose_hangul('\u{ac00}').unwrap();
        assert_eq!(open, vec!['\u{1100}', '\u{1161}']);
        assert!(decompose_hangul('A').is_none());
    }

    #[test]
    fn corrected_text_is_stable() {
        let deco = AppleDecompose::new();
        let once = deco.correct("Žluťoučký 한국 Ý");
        assert_eq!(deco.correct(&once), once);
    }
}
