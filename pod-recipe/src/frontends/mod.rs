mod recipe_file;

pub use recipe_file::RecipeFileFrontend;
