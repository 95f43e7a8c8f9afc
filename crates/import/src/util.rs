use regex::Regex;
use std::sync::OnceLock;

/// Levenshtein edit distance over `char`s using the two-row algorithm.
/// Station names are mostly multi-byte, so bytes would overcount edits.
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let a: Vec<char> = s1.chars().collect();
    let b: Vec<char> = s2.chars().collect();
    let (m, n) = (a.len(), b.len());

    if m == 0 {
        return n;
    }
    if n == 0 {
        return m;
    }

    // Keep the shorter string in the inner loop to minimise allocation.
    let (a, b, m, n) = if m <= n { (a, b, m, n) } else { (b, a, n, m) };

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=m {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

fn re_interchange_suffix() -> &'static Regex {
    static R: OnceLock<Regex> = OnceLock::new();
    R.get_or_init(|| Regex::new(r"(?i)(?:ＩＣ|ＪＣＴ|ＰＡ|ＳＡ|IC|JCT|PA|SA|料金所)$").expect("invalid regex"))
}

/// Canonical form of an interchange / station name for comparison:
/// full-width ASCII folded to half-width, whitespace removed, lowercased,
/// and a trailing "IC" / "JCT" / "料金所" style suffix dropped.
pub fn normalize_point(s: &str) -> String {
    let folded: String = s
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
            other => other,
        })
        .collect::<String>()
        .to_lowercase();
    re_interchange_suffix().replace(&folded, "").into_owned()
}

/// Normalised similarity in [0.0, 1.0]; 1.0 means identical after
/// [`normalize_point`].
pub fn point_similarity(s1: &str, s2: &str) -> f64 {
    let a = normalize_point(s1);
    let b = normalize_point(s2);
    if a == b {
        return 1.0;
    }
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein_distance(&a, &b) as f64 / max_len as f64)
}
