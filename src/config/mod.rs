mod load;
mod types;

pub use load::{load_configuration, migrate_shape};
pub use types::{
    AllowedHost, AttachmentsConfig, Composition, Configuration, ConnectionConfig,
    ConnectionProtocol, OAuthConfig, ProxyConfig, RecipientsConfig, Secret, StackOverrides,
    TemplateSpec,
};
