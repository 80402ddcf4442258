use anyhow::{Result, anyhow, bail};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

const BUILTIN_PROMPTS: [(&str, &str); 4] = [
    ("v1_basic", include_str!("../prompts/v1_basic.md")),
    ("v2_structured", include_str!("../prompts/v2_structured.md")),
    ("v3_analytical", include_str!("../prompts/v3_analytical.md")),
    ("v4_professional", include_str!("../prompts/v4_professional.md")),
];

const PROMPT_EXTENSIONS: [&str; 2] = ["md", "txt"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptVariant {
    pub name: String,
    pub system_prompt: String,
}

impl PromptVariant {
    pub fn new(name: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
        }
    }
}

/// Named system prompts, built once at startup and read-only afterwards.
#[derive(Debug, Clone)]
pub struct PromptRegistry {
    variants: BTreeMap<String, PromptVariant>,
    default: PromptVariant,
}

impl PromptRegistry {
    /// Built-in variants, overridden or extended by `*.md`/`*.txt` files in `prompts_dir`.
    ///
    /// Without `default_prompt` the lexicographically last name is the default.
    pub fn load(prompts_dir: Option<&Path>, default_prompt: Option<&str>) -> Result<Self> {
        let mut variants = builtin_variants();
        if let Some(dir) = prompts_dir {
            for variant in load_directory(dir)? {
                variants.insert(variant.name.clone(), variant);
            }
        }

        let default = match default_prompt {
            Some(name) => variants
                .get(name)
                .cloned()
                .ok_or_else(|| unknown_variant(name, &variants))?,
            None => last_variant(&variants)
                .cloned()
                .ok_or_else(|| anyhow!("Failed to load prompts: no prompt variants available"))?,
        };

        Ok(Self { variants, default })
    }

    pub fn get(&self, name: &str) -> Option<&PromptVariant> {
        self.variants.get(name)
    }

    /// Looks up every name, failing on the first unknown one. An empty list selects all variants.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<PromptVariant>> {
        if names.is_empty() {
            return Ok(self.variants.values().cloned().collect());
        }

        names
            .iter()
            .map(|name| {
                self.get(name)
                    .cloned()
                    .ok_or_else(|| unknown_variant(name, &self.variants))
            })
            .collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.variants.keys().map(String::as_str)
    }

    pub fn default_variant(&self) -> &PromptVariant {
        &self.default
    }
}

fn builtin_variants() -> BTreeMap<String, PromptVariant> {
    BUILTIN_PROMPTS
        .iter()
        .map(|(name, text)| {
            (
                (*name).to_string(),
                PromptVariant::new(*name, text.trim_end()),
            )
        })
        .collect()
}

fn last_variant(variants: &BTreeMap<String, PromptVariant>) -> Option<&PromptVariant> {
    variants.values().next_back()
}

fn load_directory(dir: &Path) -> Result<Vec<PromptVariant>> {
    let entries = fs::read_dir(dir).map_err(|err| {
        anyhow!(
            "Failed to load prompts from {}: unable to read directory: {err}",
            dir.display()
        )
    })?;

    let mut variants = Vec::new();
    for entry in entries {
        let path = entry?.path();
        let is_prompt = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| PROMPT_EXTENSIONS.contains(&ext));
        if !path.is_file() || !is_prompt {
            continue;
        }

        let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        let text = fs::read_to_string(&path).map_err(|err| {
            anyhow!(
                "Failed to load prompt {}: unable to read file: {err}",
                path.display()
            )
        })?;
        if text.trim().is_empty() {
            bail!("Failed to load prompt {}: file is empty", path.display());
        }

        variants.push(PromptVariant::new(name, text.trim_end()));
    }

    Ok(variants)
}

fn unknown_variant(name: &str, variants: &BTreeMap<String, PromptVariant>) -> anyhow::Error {
    let available = variants.keys().cloned().collect::<Vec<_>>().join(", ");
    anyhow!("unknown prompt variant '{name}' (available: {available})")
}
