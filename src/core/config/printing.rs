use crate::core::config::data::Config;
use crate::core::config::defaults::DEFAULT_BASE_URL;

impl Config {
    pub fn print_all(&self) {
        println!("Current configuration:");
        match &self.base_url {
            Some(url) => println!("  base-url: {url}"),
            None => println!("  base-url: (unset, using {DEFAULT_BASE_URL})"),
        }
        match &self.default_model {
            Some(model) => println!("  default-model: {model}"),
            None => println!("  default-model: (unset)"),
        }
        match self.turn_timeout_secs {
            Some(secs) => println!("  turn-timeout-secs: {secs}"),
            None => println!("  turn-timeout-secs: (unset, no timeout)"),
        }
    }
}
