//! Compose file parser.

use super::types::*;
use crate::error::{KilnError, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, instrument};

/// Parser for compose files.
pub struct ComposeParser;

impl ComposeParser {
    /// Parse a compose file from a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid, no services are defined, or
    /// a service declares neither an image nor a build.
    #[instrument(skip(content))]
    pub fn parse(content: &str) -> Result<ComposeProject> {
        debug!("Parsing compose file");

        let project: ComposeProject =
            serde_yaml::from_str(content).map_err(|e| KilnError::InvalidSpec {
                reason: format!("compose parse error: {}", e),
            })?;

        Self::validate_services(&project.services)?;
        Ok(project)
    }

    /// Parse a compose file from a file path.
    #[instrument]
    pub fn parse_file<P: AsRef<Path> + std::fmt::Debug>(path: P) -> Result<ComposeProject> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| KilnError::io(path, e))?;
        Self::parse(&content)
    }

    /// Each service must declare an image or a build configuration (or both).
    fn validate_services(services: &HashMap<String, ComposeService>) -> Result<()> {
        if services.is_empty() {
            return Err(KilnError::InvalidSpec {
                reason: "no services defined in compose file".to_string(),
            });
        }

        for (name, service) in services {
            if service.image.is_empty() && service.build.is_none() {
                return Err(KilnError::InvalidSpec {
                    reason: format!(
                        "compose service '{}' must have either 'image' or 'build' specified",
                        name
                    ),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_SERVICES: &str = r#"
version: "3.8"
services:
  web:
    build: ./web
    ports:
      - "8080:80"
    depends_on: [api]
    restart: always
  api:
    build:
      context: ./api
      dockerfile: Dockerfile.api
      args:
        VERSION: "2"
    environment:
      DB_URL: postgres://db
      EMPTY:
"#;

    #[test]
    fn test_parse_two_services() {
        let project = ComposeParser::parse(TWO_SERVICES).unwrap();
        assert_eq!(project.services.len(), 2);

        let web = &project.services["web"];
        let build = web.build.as_ref().unwrap();
        assert_eq!(build.context(), "./web");
        assert_eq!(build.dockerfile(), "Dockerfile");
        assert_eq!(web.ports, vec!["8080:80"]);
        assert_eq!(web.depends_on, vec!["api"]);
        assert_eq!(web.restart, "always");

        let api = &project.services["api"];
        let build = api.build.as_ref().unwrap();
        assert_eq!(build.context(), "./api");
        assert_eq!(build.dockerfile(), "Dockerfile.api");
        assert_eq!(build.args().get("VERSION"), Some(&"2".to_string()));

        let env = api.environment.to_map();
        assert_eq!(env.get("DB_URL"), Some(&"postgres://db".to_string()));
        assert_eq!(env.get("EMPTY"), Some(&String::new()));
    }

    #[test]
    fn test_image_only_service() {
        let project = ComposeParser::parse(
            "services:\n  cache:\n    image: redis:7-alpine\n",
        )
        .unwrap();
        assert_eq!(project.services["cache"].image, "redis:7-alpine");
        assert!(project.services["cache"].build.is_none());
    }

    #[test]
    fn test_no_services() {
        assert!(ComposeParser::parse("version: '3'\n").is_err());
        assert!(ComposeParser::parse("services: {}\n").is_err());
    }

    #[test]
    fn test_service_without_image_or_build() {
        let err = ComposeParser::parse("services:\n  web:\n    ports: ['80:80']\n").unwrap_err();
        assert!(err.to_string().contains("'image' or 'build'"));
    }

    #[test]
    fn test_environment_list_form() {
        let project = ComposeParser::parse(
            "services:\n  app:\n    image: x\n    environment:\n      - A=1\n      - B=2\n",
        )
        .unwrap();
        let env = project.services["app"].environment.to_map();
        assert_eq!(env.get("A"), Some(&"1".to_string()));
        assert_eq!(env.get("B"), Some(&"2".to_string()));
    }
}
