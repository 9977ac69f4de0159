//! Two-level tag taxonomy: main categories and the sub categories each one
//! permits.
//!
//! The taxonomy is loaded once at startup and shared immutably. The only way
//! to obtain a [`Classification`] is through [`Taxonomy::classification`], so
//! every value that reaches a write path has already been checked.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum TaxonomyError {
    #[error("unknown main category `{0}`")]
    UnknownMain(String),
    #[error("sub category `{sub}` is not permitted under `{main}`")]
    SubNotPermitted { main: String, sub: String },
    #[error("invalid taxonomy: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubCategory {
    pub code: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainCategory {
    pub code: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub subs: Vec<SubCategory>,
}

impl MainCategory {
    pub fn permits(&self, sub: &str) -> bool {
        self.subs.iter().any(|s| s.code == sub)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Taxonomy {
    #[serde(rename = "category")]
    categories: Vec<MainCategory>,
}

/// A `(main, sub)` pair that is known to be valid for the taxonomy that
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Classification {
    main: String,
    sub: Option<String>,
}

impl Classification {
    pub fn main(&self) -> &str {
        &self.main
    }

    pub fn sub(&self) -> Option<&str> {
        self.sub.as_deref()
    }

    pub fn into_parts(self) -> (String, Option<String>) {
        (self.main, self.sub)
    }
}

type BuiltinCategory = (&'static str, &'static str, &'static [(&'static str, &'static str)]);

const BUILTIN: &[BuiltinCategory] = &[
    (
        "CHARACTER_RELATED",
        "Attributes of a depicted character: clothing, hair, body, count, accessories",
        &[
            ("CLOTHING", "garments, uniforms, footwear, headwear"),
            ("HAIR", "hair style, length, colour, hair accessories"),
            ("CHARACTER_COUNT", "number and gender of characters (1girl, solo, multiple_boys)"),
            ("BODY_FEATURES", "physique and distinctive body traits"),
            ("BODY_PARTS", "individual body parts such as eyes, hands, ears"),
            ("ACCESSORIES", "jewellery, glasses, ribbons, ornaments"),
            ("COLORS", "colour attributes of a character"),
            ("COSMETICS", "makeup, nail polish, tattoos"),
        ],
    ),
    (
        "CHARACTER",
        "A specific named character",
        &[],
    ),
    (
        "OBJECTS",
        "Items and things present in the scene",
        &[
            ("WEAPONS", "swords, guns, bows and other arms"),
            ("VEHICLES", "cars, bikes, ships, aircraft"),
            ("FURNITURE", "chairs, beds, tables"),
            ("FOOD", "food and drink"),
            ("ANIMALS", "animals and creatures that are not the subject"),
            ("MISCELLANEOUS", "any other object"),
            ("MATERIALS", "fabrics, textures and substances"),
        ],
    ),
    (
        "ENVIRONMENT",
        "Where the scene takes place and its background",
        &[
            ("INDOOR", "rooms and interiors"),
            ("OUTDOOR", "exteriors and open spaces"),
            ("NATURE", "forests, sea, sky, plants"),
            ("URBAN", "cities, streets, buildings"),
            ("FANTASY", "imaginary or otherworldly settings"),
        ],
    ),
    (
        "COMPOSITION",
        "Camera, framing and viewpoint of the image",
        &[
            ("CAMERA_ANGLE", "from above, from below, dutch angle"),
            ("FRAMING", "upper body, full body, close-up"),
            ("PERSPECTIVE", "point of view and where the subject looks"),
            ("CROP", "cut-off and out-of-frame parts"),
        ],
    ),
    (
        "VISUAL_EFFECTS",
        "Lighting, colour treatment and rendering effects",
        &[
            ("LIGHTING", "light sources, backlight, shadows"),
            ("COLORS", "palette and colour treatment of the whole image"),
            ("EFFECTS", "sparkles, blur, lens flare, particles"),
            ("RENDERING", "rendering technique and post-processing"),
            ("SHAPES", "geometric shapes and patterns"),
        ],
    ),
    (
        "ART_STYLE",
        "Artistic style or medium",
        &[
            ("ANIME", "anime and manga styles"),
            ("REALISTIC", "photorealistic styles"),
            ("CARTOON", "western cartoon and chibi styles"),
            ("PAINTERLY", "traditional media: watercolor, oil, sketch"),
        ],
    ),
    (
        "ACTION_POSE",
        "What a character is doing and how they are posed",
        &[
            ("POSE", "sitting, standing, lying"),
            ("EXPRESSION", "facial expressions"),
            ("GESTURE", "hand and arm gestures"),
            ("BODY_POSE", "posture of the whole body"),
            ("INTERACTION", "actions involving other characters"),
            ("PROPS", "holding or using an object"),
        ],
    ),
    (
        "COPYRIGHT",
        "A franchise, series or work",
        &[],
    ),
    (
        "ARTIST",
        "A specific artist or circle",
        &[],
    ),
    (
        "QUALITY",
        "Image quality descriptors",
        &[],
    ),
    (
        "TECHNICAL",
        "Metadata about the image file or its provenance",
        &[
            ("METADATA", "resolution, format, aspect ratio"),
            ("QUALITY", "technical defects and quality markers"),
            ("SOURCE", "translation, commentary, official art"),
            ("FRAMING", "borders, letterboxing, multiple views"),
        ],
    ),
    (
        "ADULT_CONTENT",
        "Sexual or suggestive content",
        &[
            ("SEXUAL", "sexual acts"),
            ("EXPLICIT_BODY", "explicit nudity"),
            ("SUGGESTIVE", "suggestive but not explicit"),
            ("CENSORSHIP", "censoring marks and mosaics"),
        ],
    ),
    (
        "THEME_CONCEPT",
        "Abstract themes, seasons, holidays and time",
        &[
            ("SEASON", "spring, summer, autumn, winter"),
            ("HOLIDAY", "christmas, halloween, new year"),
            ("TIME", "day, night, sunset"),
            ("WEATHER", "rain, snow, fog"),
            ("CONCEPT", "abstract ideas and motifs"),
        ],
    ),
];

impl Taxonomy {
    /// The built-in fourteen-category taxonomy.
    pub fn builtin() -> Self {
        let categories = BUILTIN
            .iter()
            .map(|(code, description, subs)| MainCategory {
                code: (*code).to_string(),
                description: (*description).to_string(),
                subs: subs
                    .iter()
                    .map(|(code, description)| SubCategory {
                        code: (*code).to_string(),
                        description: (*description).to_string(),
                    })
                    .collect(),
            })
            .collect();
        Self { categories }
    }

    pub fn from_categories(categories: Vec<MainCategory>) -> Result<Self, TaxonomyError> {
        let taxonomy = Self { categories };
        taxonomy.check()?;
        Ok(taxonomy)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, TaxonomyError> {
        let taxonomy: Taxonomy =
            toml::from_str(content).map_err(|e| TaxonomyError::Invalid(e.to_string()))?;
        taxonomy.check()?;
        Ok(taxonomy)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, TaxonomyError> {
        let content = fs::read_to_string(path)
            .map_err(|e| TaxonomyError::Invalid(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Loads `path` when given, the built-in taxonomy otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, TaxonomyError> {
        match path {
            Some(p) => Self::from_toml_file(p),
            None => Ok(Self::builtin()),
        }
    }

    fn check(&self) -> Result<(), TaxonomyError> {
        if self.categories.is_empty() {
            return Err(TaxonomyError::Invalid("no main categories".into()));
        }
        let mut seen = HashSet::new();
        for main in &self.categories {
            if main.code.trim().is_empty() {
                return Err(TaxonomyError::Invalid("empty main category code".into()));
            }
            if !seen.insert(main.code.as_str()) {
                return Err(TaxonomyError::Invalid(format!(
                    "duplicate main category `{}`",
                    main.code
                )));
            }
            let mut subs = HashSet::new();
            for sub in &main.subs {
                if sub.code.trim().is_empty() || !subs.insert(sub.code.as_str()) {
                    return Err(TaxonomyError::Invalid(format!(
                        "bad sub category `{}` under `{}`",
                        sub.code, main.code
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn categories(&self) -> &[MainCategory] {
        &self.categories
    }

    pub fn main(&self, code: &str) -> Option<&MainCategory> {
        self.categories.iter().find(|m| m.code == code)
    }

    pub fn contains_main(&self, code: &str) -> bool {
        self.main(code).is_some()
    }

    pub fn permits(&self, main: &str, sub: &str) -> bool {
        self.main(main).map(|m| m.permits(sub)).unwrap_or(false)
    }

    /// Validates a `(main, sub)` pair. A `sub` of `None` is always valid for a
    /// known main category.
    pub fn classification(
        &self,
        main: &str,
        sub: Option<&str>,
    ) -> Result<Classification, TaxonomyError> {
        let category = self
            .main(main)
            .ok_or_else(|| TaxonomyError::UnknownMain(main.to_string()))?;
        if let Some(sub) = sub {
            if !category.permits(sub) {
                return Err(TaxonomyError::SubNotPermitted {
                    main: main.to_string(),
                    sub: sub.to_string(),
                });
            }
        }
        Ok(Classification {
            main: main.to_string(),
            sub: sub.map(str::to_string),
        })
    }
}
