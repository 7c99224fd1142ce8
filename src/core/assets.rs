//! Embedded project templates.
//!
//! The default descriptor and env example are baked into the binary so `init`
//! works without any files on disk.

/// Embeds template files at compile time as text.
///
/// Generates:
/// - Public constants for each embedded template
/// - `get_template(name)` for lookup
/// - `list_templates()` for discovery
macro_rules! embedded_templates {
    ($($path:expr => $const_name:ident),* $(,)?) => {
        $(
            pub const $const_name: &str =
                include_str!(concat!("../../templates/", $path));
        )*

        pub fn get_template(name: &str) -> Option<&'static str> {
            match name {
                $( $path => Some($const_name), )*
                _ => None,
            }
        }

        pub fn list_templates() -> Vec<&'static str> {
            vec![ $( $path, )* ]
        }
    };
}

embedded_templates! {
    "boardstack.toml" => TEMPLATE_BOARDSTACK_TOML,
    "env.example" => TEMPLATE_ENV_EXAMPLE,
}
