use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};

/// One (locale, category) pair to crawl.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub locale: String,
    pub category: String,
}

impl Target {
    pub fn new(locale: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            locale: locale.into(),
            category: category.into(),
        }
    }

    pub fn landing_url(&self, template: &str) -> String {
        template
            .replace("{locale}", &self.locale)
            .replace("{category}", &self.category)
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.locale, self.category)
    }
}

/// Lowercased, trimmed values, blanks skipped, first occurrence wins.
pub fn parse_list(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.lines()
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty())
        .filter(|l| seen.insert(l.clone()))
        .collect()
}

pub fn load_list(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading target list {}", path.display()))?;
    Ok(parse_list(&text))
}

/// Every city with every category, cities outermost.
pub fn enumerate(cities: &[String], categories: &[String]) -> Vec<Target> {
    cities
        .iter()
        .flat_map(|city| categories.iter().map(move |cat| Target::new(city.clone(), cat.clone())))
        .collect()
}

pub fn load_targets(city_file: &Path, category_file: &Path) -> Result<Vec<Target>> {
    let cities = load_list(city_file)?;
    let categories = load_list(category_file)?;
    Ok(enumerate(&cities, &categories))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn list_normalisation() {
        let list = parse_list("  SanDiego \n\nlosangeles\nsandiego\n\t\n");
        assert_eq!(list, vec!["sandiego", "losangeles"]);
    }

    #[test]
    fn cross_product_in_order() {
        let cities = vec!["a".to_string(), "b".to_string()];
        let cats = vec!["x".to_string(), "y".to_string()];
        let targets = enumerate(&cities, &cats);
        assert_eq!(
            targets,
            vec![
                Target::new("a", "x"),
                Target::new("a", "y"),
                Target::new("b", "x"),
                Target::new("b", "y"),
            ]
        );
        assert!(enumerate(&cities, &[]).is_empty());
    }

    #[test]
    fn landing_url_from_template() {
        let t = Target::new("metroa", "forsale");
        assert_eq!(
            t.landing_url("http://{locale}.backpage.com/{category}/"),
            "http://metroa.backpage.com/forsale/"
        );
        assert_eq!(t.to_string(), "metroa/forsale");
    }

    #[test]
    fn load_from_files() {
        let mut cities = tempfile::NamedTempFile::new().unwrap();
        writeln!(cities, "MetroA\nmetroa\n").unwrap();
        let mut cats = tempfile::NamedTempFile::new().unwrap();
        writeln!(cats, "ForSale\nJobs").unwrap();
        let targets = load_targets(cities.path(), cats.path()).unwrap();
        assert_eq!(targets, vec![Target::new("metroa", "forsale"), Target::new("metroa", "jobs")]);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_list(Path::new("/nonexistent/cities.txt")).is_err());
    }
}
