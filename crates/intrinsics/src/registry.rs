//! Recipe registry for lookup and discovery.

use crate::error::RecipeError;
use crate::recipe::{IntrinMatchResult, Recipe};
use crate::wmma::{mma_sync_fp16_fp32, wmma_fp16_fp32};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default, Clone)]
pub struct RecipeRegistry {
    recipes: Vec<Arc<Recipe>>,
}

impl RecipeRegistry {
    pub fn new() -> Self {
        Self {
            recipes: Vec::new(),
        }
    }

    pub fn with_default_recipes() -> Result<Self, RecipeError> {
        let mut registry = Self::new();
        registry.register(wmma_fp16_fp32()?);
        registry.register(mma_sync_fp16_fp32()?);
        Ok(registry)
    }

    pub fn register(&mut self, recipe: Recipe) {
        debug!(recipe = recipe.name(), scope = ?recipe.scope(), "registered recipe");
        self.recipes.push(Arc::new(recipe));
    }

    pub fn recipes(&self) -> &[Arc<Recipe>] {
        &self.recipes
    }

    pub fn find(&self, name: &str) -> Option<Arc<Recipe>> {
        self.recipes
            .iter()
            .find(|recipe| recipe.name() == name)
            .map(Arc::clone)
    }

    /// Resolve a recipe variant into a match result.
    pub fn resolve(
        &self,
        name: &str,
        compute_key: &str,
        shape_key: &str,
    ) -> Result<IntrinMatchResult, RecipeError> {
        let recipe = self.find(name).ok_or_else(|| RecipeError::Malformed {
            recipe: name.to_string(),
            reason: "not registered".to_string(),
        })?;
        if !recipe.supports(compute_key, shape_key) {
            return Err(RecipeError::UnknownShapeKey {
                recipe: name.to_string(),
                shape_key: format!("{}/{}", compute_key, shape_key),
            });
        }
        Ok(IntrinMatchResult::new(recipe, compute_key, shape_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry() {
        let registry = RecipeRegistry::with_default_recipes().unwrap();
        assert_eq!(registry.recipes().len(), 2);
        let matched = registry.resolve("wmma_fp16_fp32", "ntn", "8x32x16").unwrap();
        assert_eq!(matched.recipe.name(), "wmma_fp16_fp32");
        assert_eq!(matched.shape_key, "8x32x16");
        assert!(registry.resolve("mma_sync_fp16_fp32", "nnn", "32x8x16").is_err());
        assert!(registry.find("cutlass").is_none());
    }
}
