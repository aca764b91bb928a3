use std::sync::Arc;

use armada_client::entities::Service;

use crate::variables::Variables;

/// Stateless predicate over a service spec. A service failing any
/// validator is never handed to the container engine, and its state
/// is reported as exited with the validator's message.
pub trait Validator: Send + Sync {
  fn name(&self) -> &'static str;
  /// Err carries the human readable reason the service is rejected.
  fn validate(&self, service: &Service) -> Result<(), String>;
}

pub fn default_validators(
  variables: Arc<Variables>,
) -> Arc<Vec<Box<dyn Validator>>> {
  Arc::new(vec![
    Box::new(CustomCommandsValidator {
      variables: variables.clone(),
    }),
    Box::new(PrivilegedValidator {
      variables: variables.clone(),
    }),
    Box::new(ImageWhitelistValidator { variables }),
  ])
}

struct CustomCommandsValidator {
  variables: Arc<Variables>,
}

impl Validator for CustomCommandsValidator {
  fn name(&self) -> &'static str {
    "custom-commands"
  }
  fn validate(&self, service: &Service) -> Result<(), String> {
    let blocked = self.variables.get().disable_custom_commands
      && (!service.command.is_empty()
        || !service.entrypoint.is_empty());
    if blocked {
      return Err(String::from(
        "custom commands are disabled on this device",
      ));
    }
    Ok(())
  }
}

struct PrivilegedValidator {
  variables: Arc<Variables>,
}

impl Validator for PrivilegedValidator {
  fn name(&self) -> &'static str {
    "privileged"
  }
  fn validate(&self, service: &Service) -> Result<(), String> {
    if service.privileged && self.variables.get().disable_privileged
    {
      return Err(String::from(
        "privileged containers are disabled on this device",
      ));
    }
    Ok(())
  }
}

struct ImageWhitelistValidator {
  variables: Arc<Variables>,
}

impl Validator for ImageWhitelistValidator {
  fn name(&self) -> &'static str {
    "image-whitelist"
  }
  fn validate(&self, service: &Service) -> Result<(), String> {
    let variables = self.variables.get();
    let Some(whitelist) = &variables.whitelisted_images else {
      return Ok(());
    };
    if whitelist.iter().any(|image| image == &service.image) {
      return Ok(());
    }
    Err(format!(
      "image {} is not in the device image whitelist",
      service.image
    ))
  }
}
