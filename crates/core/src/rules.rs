use crate::store::TagStore;
use crate::taxonomy::{Classification, Taxonomy, TaxonomyError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use walkdir::WalkDir;

/// Evaluated in declaration order of the variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    Exact,
    Suffix,
    Prefix,
    Substring,
}

impl PatternKind {
    pub fn matches(self, name: &str, pattern: &str) -> bool {
        match self {
            PatternKind::Exact => name == pattern,
            PatternKind::Suffix => name.ends_with(pattern),
            PatternKind::Prefix => name.starts_with(pattern),
            PatternKind::Substring => name.contains(pattern),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Rule {
    pub kind: PatternKind,
    pub pattern: String,
    pub main: String,
    #[serde(default)]
    pub sub: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl Rule {
    pub fn new(kind: PatternKind, pattern: &str, main: &str, sub: Option<&str>) -> Self {
        Self {
            kind,
            pattern: pattern.to_string(),
            main: main.to_string(),
            sub: sub.map(str::to_string),
            enabled: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<Rule>,
}

/// Loads every `*.toml` file under `dir` (sorted by path), each holding a
/// `[[rules]]` array.
pub fn load_rules_from_dir(dir: &Path) -> anyhow::Result<Vec<Rule>> {
    let mut rules = Vec::new();
    if !dir.exists() {
        return Ok(rules);
    }
    let mut files: Vec<_> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("toml"))
        .map(|e| e.into_path())
        .collect();
    files.sort();
    for path in files {
        let content = fs::read_to_string(&path)?;
        let file: RuleFile = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))?;
        rules.extend(file.rules.into_iter().filter(|r| r.enabled));
    }
    Ok(rules)
}

type BuiltinRule = (PatternKind, &'static str, &'static str, Option<&'static str>);

const CR: &str = "CHARACTER_RELATED";

/// Built-in rule table. Order inside a kind is significant.
const BUILTIN_RULES: &[BuiltinRule] = {
    use PatternKind::*;
    &[
        // exact
        (Exact, "masterpiece", "QUALITY", None),
        (Exact, "best_quality", "QUALITY", None),
        (Exact, "high_quality", "QUALITY", None),
        (Exact, "normal_quality", "QUALITY", None),
        (Exact, "low_quality", "QUALITY", None),
        (Exact, "worst_quality", "QUALITY", None),
        (Exact, "highres", "TECHNICAL", Some("METADATA")),
        (Exact, "absurdres", "TECHNICAL", Some("METADATA")),
        (Exact, "incredibly_absurdres", "TECHNICAL", Some("METADATA")),
        (Exact, "lowres", "TECHNICAL", Some("METADATA")),
        (Exact, "4k", "TECHNICAL", Some("METADATA")),
        (Exact, "8k", "TECHNICAL", Some("METADATA")),
        (Exact, "official_art", "TECHNICAL", Some("SOURCE")),
        (Exact, "translated", "TECHNICAL", Some("SOURCE")),
        (Exact, "commentary_request", "TECHNICAL", Some("SOURCE")),
        (Exact, "1girl", CR, Some("CHARACTER_COUNT")),
        (Exact, "2girls", CR, Some("CHARACTER_COUNT")),
        (Exact, "3girls", CR, Some("CHARACTER_COUNT")),
        (Exact, "4girls", CR, Some("CHARACTER_COUNT")),
        (Exact, "5girls", CR, Some("CHARACTER_COUNT")),
        (Exact, "6+girls", CR, Some("CHARACTER_COUNT")),
        (Exact, "1boy", CR, Some("CHARACTER_COUNT")),
        (Exact, "2boys", CR, Some("CHARACTER_COUNT")),
        (Exact, "3boys", CR, Some("CHARACTER_COUNT")),
        (Exact, "4boys", CR, Some("CHARACTER_COUNT")),
        (Exact, "5boys", CR, Some("CHARACTER_COUNT")),
        (Exact, "6+boys", CR, Some("CHARACTER_COUNT")),
        (Exact, "solo", CR, Some("CHARACTER_COUNT")),
        (Exact, "no_humans", CR, Some("CHARACTER_COUNT")),
        (Exact, "portrait", "COMPOSITION", Some("FRAMING")),
        (Exact, "close-up", "COMPOSITION", Some("FRAMING")),
        (Exact, "upper_body", "COMPOSITION", Some("FRAMING")),
        (Exact, "lower_body", "COMPOSITION", Some("FRAMING")),
        (Exact, "full_body", "COMPOSITION", Some("FRAMING")),
        (Exact, "cowboy_shot", "COMPOSITION", Some("FRAMING")),
        (Exact, "pov", "COMPOSITION", Some("PERSPECTIVE")),
        (Exact, "indoors", "ENVIRONMENT", Some("INDOOR")),
        (Exact, "outdoors", "ENVIRONMENT", Some("OUTDOOR")),
        (Exact, "sky", "ENVIRONMENT", Some("NATURE")),
        (Exact, "smile", "ACTION_POSE", Some("EXPRESSION")),
        (Exact, "blush", "ACTION_POSE", Some("EXPRESSION")),
        (Exact, "open_mouth", "ACTION_POSE", Some("EXPRESSION")),
        (Exact, "monochrome", "VISUAL_EFFECTS", Some("COLORS")),
        (Exact, "greyscale", "VISUAL_EFFECTS", Some("COLORS")),
        (Exact, "sketch", "ART_STYLE", Some("PAINTERLY")),
        (Exact, "chibi", "ART_STYLE", Some("CARTOON")),
        (Exact, "realistic", "ART_STYLE", Some("REALISTIC")),
        // suffix
        (Suffix, "_hair", CR, Some("HAIR")),
        (Suffix, "_eyes", CR, Some("BODY_PARTS")),
        (Suffix, "_uniform", CR, Some("CLOTHING")),
        (Suffix, "_dress", CR, Some("CLOTHING")),
        (Suffix, "_shirt", CR, Some("CLOTHING")),
        (Suffix, "_skirt", CR, Some("CLOTHING")),
        (Suffix, "_jacket", CR, Some("CLOTHING")),
        (Suffix, "_sleeves", CR, Some("CLOTHING")),
        (Suffix, "_gloves", CR, Some("CLOTHING")),
        (Suffix, "_boots", CR, Some("CLOTHING")),
        (Suffix, "_hat", CR, Some("CLOTHING")),
        (Suffix, "_swimsuit", CR, Some("CLOTHING")),
        (Suffix, "_bikini", CR, Some("CLOTHING")),
        (Suffix, "_kimono", CR, Some("CLOTHING")),
        (Suffix, "_thighhighs", CR, Some("CLOTHING")),
        (Suffix, "_legwear", CR, Some("CLOTHING")),
        (Suffix, "_ornament", CR, Some("ACCESSORIES")),
        (Suffix, "_background", "ENVIRONMENT", None),
        (Suffix, "_quality", "QUALITY", None),
        (Suffix, "_lighting", "VISUAL_EFFECTS", Some("LIGHTING")),
        (Suffix, "_light", "VISUAL_EFFECTS", Some("LIGHTING")),
        (Suffix, "_focus", "COMPOSITION", Some("FRAMING")),
        (Suffix, "_smile", "ACTION_POSE", Some("EXPRESSION")),
        (Suffix, "_mouth", "ACTION_POSE", Some("EXPRESSION")),
        (Suffix, "_pose", "ACTION_POSE", Some("POSE")),
        (Suffix, "_style", "ART_STYLE", None),
        (Suffix, "_sword", "OBJECTS", Some("WEAPONS")),
        (Suffix, "_(weapon)", "OBJECTS", Some("WEAPONS")),
        // prefix
        (Prefix, "from_", "COMPOSITION", Some("CAMERA_ANGLE")),
        (Prefix, "looking_", "COMPOSITION", Some("PERSPECTIVE")),
        (Prefix, "hair_", CR, Some("HAIR")),
        (Prefix, "multiple_", CR, Some("CHARACTER_COUNT")),
        (Prefix, "holding_", "ACTION_POSE", Some("PROPS")),
        (Prefix, "hand_", "ACTION_POSE", Some("GESTURE")),
        (Prefix, "hands_", "ACTION_POSE", Some("GESTURE")),
        (Prefix, "arms_", "ACTION_POSE", Some("GESTURE")),
        (Prefix, "background", "ENVIRONMENT", None),
        // substring
        (Substring, "quality", "QUALITY", None),
        (Substring, "background", "ENVIRONMENT", None),
        (Substring, "ponytail", CR, Some("HAIR")),
        (Substring, "twintails", CR, Some("HAIR")),
        (Substring, "braid", CR, Some("HAIR")),
        (Substring, "ahoge", CR, Some("HAIR")),
        (Substring, "bangs", CR, Some("HAIR")),
        (Substring, "uniform", CR, Some("CLOTHING")),
        (Substring, "dress", CR, Some("CLOTHING")),
        (Substring, "shirt", CR, Some("CLOTHING")),
        (Substring, "skirt", CR, Some("CLOTHING")),
        (Substring, "sleeve", CR, Some("CLOTHING")),
        (Substring, "jacket", CR, Some("CLOTHING")),
        (Substring, "kimono", CR, Some("CLOTHING")),
        (Substring, "swimsuit", CR, Some("CLOTHING")),
        (Substring, "bikini", CR, Some("CLOTHING")),
        (Substring, "thighhighs", CR, Some("CLOTHING")),
        (Substring, "pantyhose", CR, Some("CLOTHING")),
        (Substring, "gloves", CR, Some("CLOTHING")),
        (Substring, "boots", CR, Some("CLOTHING")),
        (Substring, "shoes", CR, Some("CLOTHING")),
        (Substring, "socks", CR, Some("CLOTHING")),
        (Substring, "necktie", CR, Some("CLOTHING")),
        (Substring, "necklace", CR, Some("ACCESSORIES")),
        (Substring, "earrings", CR, Some("ACCESSORIES")),
        (Substring, "glasses", CR, Some("ACCESSORIES")),
        (Substring, "choker", CR, Some("ACCESSORIES")),
        (Substring, "ribbon", CR, Some("ACCESSORIES")),
        (Substring, "breasts", CR, Some("BODY_FEATURES")),
        (Substring, "muscular", CR, Some("BODY_FEATURES")),
        (Substring, "lighting", "VISUAL_EFFECTS", Some("LIGHTING")),
        (Substring, "sunlight", "VISUAL_EFFECTS", Some("LIGHTING")),
        (Substring, "moonlight", "VISUAL_EFFECTS", Some("LIGHTING")),
        (Substring, "backlight", "VISUAL_EFFECTS", Some("LIGHTING")),
        (Substring, "shadow", "VISUAL_EFFECTS", Some("LIGHTING")),
        (Substring, "sparkle", "VISUAL_EFFECTS", Some("EFFECTS")),
        (Substring, "lens_flare", "VISUAL_EFFECTS", Some("EFFECTS")),
        (Substring, "blurry", "VISUAL_EFFECTS", Some("EFFECTS")),
        (Substring, "watercolor", "ART_STYLE", Some("PAINTERLY")),
        (Substring, "painting", "ART_STYLE", Some("PAINTERLY")),
        (Substring, "pixel_art", "ART_STYLE", None),
        (Substring, "smile", "ACTION_POSE", Some("EXPRESSION")),
        (Substring, "blush", "ACTION_POSE", Some("EXPRESSION")),
        (Substring, "crying", "ACTION_POSE", Some("EXPRESSION")),
        (Substring, "frown", "ACTION_POSE", Some("EXPRESSION")),
        (Substring, "wink", "ACTION_POSE", Some("EXPRESSION")),
        (Substring, "sitting", "ACTION_POSE", Some("POSE")),
        (Substring, "standing", "ACTION_POSE", Some("POSE")),
        (Substring, "kneeling", "ACTION_POSE", Some("POSE")),
        (Substring, "lying", "ACTION_POSE", Some("POSE")),
        (Substring, "squatting", "ACTION_POSE", Some("POSE")),
        (Substring, "walking", "ACTION_POSE", Some("POSE")),
        (Substring, "running", "ACTION_POSE", Some("POSE")),
        (Substring, "leaning", "ACTION_POSE", Some("BODY_POSE")),
        (Substring, "hugging", "ACTION_POSE", Some("INTERACTION")),
        (Substring, "kiss", "ACTION_POSE", Some("INTERACTION")),
        (Substring, "forest", "ENVIRONMENT", Some("NATURE")),
        (Substring, "beach", "ENVIRONMENT", Some("NATURE")),
        (Substring, "ocean", "ENVIRONMENT", Some("NATURE")),
        (Substring, "mountain", "ENVIRONMENT", Some("NATURE")),
        (Substring, "cloud", "ENVIRONMENT", Some("NATURE")),
        (Substring, "city", "ENVIRONMENT", Some("URBAN")),
        (Substring, "street", "ENVIRONMENT", Some("URBAN")),
        (Substring, "classroom", "ENVIRONMENT", Some("INDOOR")),
        (Substring, "bedroom", "ENVIRONMENT", Some("INDOOR")),
        (Substring, "sword", "OBJECTS", Some("WEAPONS")),
        (Substring, "katana", "OBJECTS", Some("WEAPONS")),
        (Substring, "weapon", "OBJECTS", Some("WEAPONS")),
        (Substring, "knife", "OBJECTS", Some("WEAPONS")),
        (Substring, "flower", "OBJECTS", Some("MISCELLANEOUS")),
        (Substring, "book", "OBJECTS", Some("MISCELLANEOUS")),
        (Substring, "phone", "OBJECTS", Some("MISCELLANEOUS")),
        (Substring, "food", "OBJECTS", Some("FOOD")),
        (Substring, "fruit", "OBJECTS", Some("FOOD")),
        (Substring, "cake", "OBJECTS", Some("FOOD")),
        (Substring, "chair", "OBJECTS", Some("FURNITURE")),
        (Substring, "animal", "OBJECTS", Some("ANIMALS")),
    ]
};

pub fn builtin_rules() -> Vec<Rule> {
    BUILTIN_RULES
        .iter()
        .map(|(kind, pattern, main, sub)| Rule::new(*kind, pattern, main, *sub))
        .collect()
}

/// Upstream category codes that decide the main category on their own.
const NATIVE_OVERRIDES: &[(i64, &str)] = &[
    (1, "ARTIST"),
    (3, "COPYRIGHT"),
    (4, "CHARACTER"),
    (5, "TECHNICAL"),
];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RuleStats {
    pub native: u64,
    pub exact: u64,
    pub suffix: u64,
    pub prefix: u64,
    pub substring: u64,
    pub unmatched: u64,
    pub by_main: BTreeMap<String, u64>,
}

impl RuleStats {
    pub fn classified(&self) -> u64 {
        self.native + self.exact + self.suffix + self.prefix + self.substring
    }

    pub fn total(&self) -> u64 {
        self.classified() + self.unmatched
    }

    pub fn coverage_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.classified() as f64 / total as f64,
        }
    }

    fn record(&mut self, hit: Option<(MatchOrigin, &Classification)>) {
        match hit {
            None => self.unmatched += 1,
            Some((origin, c)) => {
                let counter = match origin {
                    MatchOrigin::Native => &mut self.native,
                    MatchOrigin::Pattern(PatternKind::Exact) => &mut self.exact,
                    MatchOrigin::Pattern(PatternKind::Suffix) => &mut self.suffix,
                    MatchOrigin::Pattern(PatternKind::Prefix) => &mut self.prefix,
                    MatchOrigin::Pattern(PatternKind::Substring) => &mut self.substring,
                };
                *counter += 1;
                *self.by_main.entry(c.main().to_string()).or_default() += 1;
            }
        }
    }
}

/// Snapshot returned by [`RuleEngine::get_stats`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleStatsReport {
    pub total_processed: u64,
    pub classified: u64,
    pub coverage_rate: f64,
    #[serde(flatten)]
    pub counters: RuleStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MatchOrigin {
    Native,
    Pattern(PatternKind),
}

#[derive(Debug, Clone)]
struct CompiledRule {
    kind: PatternKind,
    pattern: String,
    classification: Classification,
}

/// An exact rule may only pin a name the pattern kinds leave undecided or
/// decide the same way.
fn check_exact_rules(compiled: &[CompiledRule]) -> Result<(), TaxonomyError> {
    let (exact, patterns): (Vec<_>, Vec<_>) =
        compiled.iter().partition(|r| r.kind == PatternKind::Exact);
    for rule in exact {
        let shadowed = patterns
            .iter()
            .find(|p| p.kind.matches(&rule.pattern, &p.pattern))
            .filter(|p| p.classification != rule.classification);
        if let Some(p) = shadowed {
            return Err(TaxonomyError::Invalid(format!(
                "exact rule `{}` conflicts with {:?} rule `{}`",
                rule.pattern, p.kind, p.pattern
            )));
        }
    }
    Ok(())
}

/// Deterministic tag classifier: native category short-circuit, then
/// exact, suffix, prefix and substring rules, first declared match wins.
pub struct RuleEngine {
    taxonomy: Arc<Taxonomy>,
    natives: Vec<(i64, Classification)>,
    rules: Vec<CompiledRule>,
    stats: Mutex<RuleStats>,
}

impl RuleEngine {
    /// Validates every rule against `taxonomy`. Patterns are lowercased;
    /// rules are grouped by kind with declaration order kept inside a kind.
    pub fn new(taxonomy: Arc<Taxonomy>, rules: Vec<Rule>) -> Result<Self, TaxonomyError> {
        let natives = NATIVE_OVERRIDES
            .iter()
            .map(|(code, main)| taxonomy.classification(main, None).map(|c| (*code, c)))
            .collect::<Result<Vec<_>, TaxonomyError>>()?;
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules.into_iter().filter(|r| r.enabled) {
            let pattern = rule.pattern.trim().to_lowercase();
            if pattern.is_empty() {
                return Err(TaxonomyError::Invalid(format!(
                    "empty {:?} pattern for {}",
                    rule.kind, rule.main
                )));
            }
            let classification = taxonomy.classification(&rule.main, rule.sub.as_deref())?;
            compiled.push(CompiledRule {
                kind: rule.kind,
                pattern,
                classification,
            });
        }
        compiled.sort_by_key(|r| r.kind);
        check_exact_rules(&compiled)?;
        Ok(Self {
            taxonomy,
            natives,
            rules: compiled,
            stats: Mutex::new(RuleStats::default()),
        })
    }

    /// Built-in rules followed by `extra`.
    pub fn with_builtin_rules(
        taxonomy: Arc<Taxonomy>,
        extra: Vec<Rule>,
    ) -> Result<Self, TaxonomyError> {
        let mut rules = builtin_rules();
        rules.extend(extra);
        Self::new(taxonomy, rules)
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    fn lookup(&self, name: &str, native: Option<i64>) -> Option<(MatchOrigin, &Classification)> {
        if let Some(code) = native {
            if let Some((_, c)) = self.natives.iter().find(|(n, _)| *n == code) {
                return Some((MatchOrigin::Native, c));
            }
        }
        let name = name.trim().to_lowercase();
        self.rules
            .iter()
            .find(|r| r.kind.matches(&name, &r.pattern))
            .map(|r| (MatchOrigin::Pattern(r.kind), &r.classification))
    }

    pub fn classify(&self, name: &str, native: Option<i64>) -> Option<Classification> {
        let hit = self.lookup(name, native);
        if let Ok(mut stats) = self.stats.lock() {
            stats.record(hit);
        }
        hit.map(|(_, c)| c.clone())
    }

    pub fn get_stats(&self) -> RuleStatsReport {
        let counters = self.stats.lock().map(|s| s.clone()).unwrap_or_default();
        RuleStatsReport {
            total_processed: counters.total(),
            classified: counters.classified(),
            coverage_rate: counters.coverage_rate(),
            counters,
        }
    }

    pub fn reset_stats(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            *stats = RuleStats::default();
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RulePassSummary {
    pub scanned: u64,
    pub classified: u64,
    pub unmatched: u64,
}

const WRITE_CHUNK: usize = 2000;

/// Runs the engine over every unclassified tag and persists the matches.
pub async fn run_rule_pass(store: &TagStore, engine: &RuleEngine) -> anyhow::Result<RulePassSummary> {
    let pending = store.unclassified().await?;
    let mut summary = RulePassSummary {
        scanned: pending.len() as u64,
        ..Default::default()
    };
    let mut matches = Vec::with_capacity(WRITE_CHUNK);
    for tag in pending {
        match engine.classify(&tag.name, tag.native_category) {
            Some(c) => matches.push((tag.name, c)),
            None => summary.unmatched += 1,
        }
        if matches.len() >= WRITE_CHUNK {
            summary.classified += store.apply_rule_matches(&matches).await?;
            matches.clear();
        }
    }
    if !matches.is_empty() {
        summary.classified += store.apply_rule_matches(&matches).await?;
    }
    tracing::info!(
        scanned = summary.scanned,
        classified = summary.classified,
        unmatched = summary.unmatched,
        "rule pass complete"
    );
    Ok(summary)
}
