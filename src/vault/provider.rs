//! Tagged-variant provider descriptors.
//!
//! Providers differ in injection shape and validation but share no behavior
//! that benefits from trait-object polymorphism: each is a small amount of
//! static data (host patterns, header scheme, required auxiliary headers)
//! plus a strategy tag. A static registry maps provider names to cases;
//! unknown names are `UnknownProvider`, not a missing trait impl.

use crate::error::{MoatError, Result};

/// How a real credential is written into an outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectScheme {
    /// Replace the value of `header` with `format` after substituting `{}`
    /// for the token (e.g. `Authorization` / `"Bearer {}"`).
    Header {
        /// Header name to set.
        header: &'static str,
        /// Format string; `{}` is replaced with the token.
        format: &'static str,
    },
    /// HTTP Basic Auth using `x-access-token` as the username, required by
    /// git-over-HTTPS hosts.
    BasicAuthWithToken,
    /// AWS SigV4: the request must be re-signed with the resolved
    /// credentials rather than having a header substituted verbatim.
    AwsSigV4 {
        /// AWS service name used in the signing scope (e.g. `"execute-api"`).
        service: &'static str,
    },
    /// Replace a literal placeholder string anywhere in the request body
    /// with the real token, without buffering the whole body.
    BodyPlaceholder {
        /// Placeholder token to search for (e.g. `"<<SECRET>>"`).
        placeholder: &'static str,
    },
}

/// One host pattern a provider's credential applies to, and how to inject it.
#[derive(Debug, Clone, Copy)]
pub struct ProviderBinding {
    /// Host pattern: an exact hostname, or `*.example.com` for subdomains
    /// (the apex domain is intentionally excluded from a wildcard match).
    pub host_pattern: &'static str,
    /// How to write the credential into the request.
    pub inject: InjectScheme,
    /// Headers that must accompany every injected request regardless of the
    /// resolved token (e.g. Anthropic's OAuth beta headers).
    pub aux_headers: &'static [(&'static str, &'static str)],
}

impl ProviderBinding {
    /// Whether this binding applies to `host`.
    #[must_use]
    pub fn matches(&self, host: &str) -> bool {
        if let Some(suffix) = self.host_pattern.strip_prefix('*') {
            host.ends_with(suffix)
        } else {
            host == self.host_pattern
        }
    }
}

/// Static description of one credential provider.
#[derive(Debug, Clone, Copy)]
pub struct ProviderDescriptor {
    /// Provider name as used in grants (`"github"`, `"anthropic"`, ...).
    pub name: &'static str,
    /// Whether this provider supports silent OAuth refresh.
    pub oauth_refresh: bool,
    /// Host patterns and injection rules for this provider.
    pub bindings: &'static [ProviderBinding],
}

const ANTHROPIC_AUX: &[(&str, &str)] = &[
    ("anthropic-dangerous-direct-browser-access", "true"),
    ("anthropic-beta", "oauth-2025-04-20"),
];

/// Every provider known to the core at startup. Grants naming anything else
/// resolve to [`MoatError::UnknownProvider`]. `mcp-<name>` providers are
/// handled separately in [`resolve`] because their host is supplied by the
/// run's own configuration rather than being static.
pub static PROVIDERS: &[ProviderDescriptor] = &[
    ProviderDescriptor {
        name: "github",
        oauth_refresh: false,
        bindings: &[
            ProviderBinding {
                host_pattern: "api.github.com",
                inject: InjectScheme::Header {
                    header: "Authorization",
                    format: "Bearer {}",
                },
                aux_headers: &[],
            },
            ProviderBinding {
                host_pattern: "github.com",
                inject: InjectScheme::BasicAuthWithToken,
                aux_headers: &[],
            },
        ],
    },
    ProviderDescriptor {
        name: "anthropic",
        oauth_refresh: true,
        bindings: &[ProviderBinding {
            host_pattern: "api.anthropic.com",
            inject: InjectScheme::Header {
                header: "Authorization",
                format: "Bearer {}",
            },
            aux_headers: ANTHROPIC_AUX,
        }],
    },
    ProviderDescriptor {
        name: "openai",
        oauth_refresh: true,
        bindings: &[
            ProviderBinding {
                host_pattern: "api.openai.com",
                inject: InjectScheme::Header {
                    header: "Authorization",
                    format: "Bearer {}",
                },
                aux_headers: &[],
            },
            ProviderBinding {
                host_pattern: "*.openai.com",
                inject: InjectScheme::Header {
                    header: "Authorization",
                    format: "Bearer {}",
                },
                aux_headers: &[],
            },
            ProviderBinding {
                host_pattern: "chatgpt.com",
                inject: InjectScheme::Header {
                    header: "Authorization",
                    format: "Bearer {}",
                },
                aux_headers: &[],
            },
        ],
    },
    ProviderDescriptor {
        name: "aws",
        oauth_refresh: false,
        bindings: &[ProviderBinding {
            host_pattern: "*.amazonaws.com",
            inject: InjectScheme::AwsSigV4 {
                service: "execute-api",
            },
            aux_headers: &[],
        }],
    },
    ProviderDescriptor {
        name: "npm",
        oauth_refresh: false,
        bindings: &[ProviderBinding {
            host_pattern: "registry.npmjs.org",
            inject: InjectScheme::Header {
                header: "Authorization",
                format: "Bearer {}",
            },
            aux_headers: &[],
        }],
    },
    ProviderDescriptor {
        name: "google-oauth",
        oauth_refresh: true,
        bindings: &[ProviderBinding {
            host_pattern: "*.googleapis.com",
            inject: InjectScheme::Header {
                header: "Authorization",
                format: "Bearer {}",
            },
            aux_headers: &[],
        }],
    },
];

/// Prefix shared by every MCP-server grant name (`mcp-<name>`).
pub const MCP_PREFIX: &str = "mcp-";

/// Look up the static descriptor for a provider name.
///
/// `mcp-<name>` grants never have a static descriptor (their binding is
/// derived per-run from the workspace configuration by the caller) and
/// always return `None` here; callers must special-case the prefix before
/// treating `None` as [`MoatError::UnknownProvider`].
#[must_use]
pub fn find(name: &str) -> Option<&'static ProviderDescriptor> {
    PROVIDERS.iter().find(|p| p.name == name)
}

/// Validate that `name` names a known provider (static or `mcp-*`).
pub fn require_known(name: &str) -> Result<()> {
    if name.starts_with(MCP_PREFIX) || find(name).is_some() {
        Ok(())
    } else {
        Err(MoatError::UnknownProvider {
            provider: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn github_api_uses_bearer_github_git_uses_basic() {
        let gh = find("github").unwrap();
        let api = gh.bindings.iter().find(|b| b.matches("api.github.com")).unwrap();
        assert!(matches!(api.inject, InjectScheme::Header { header: "Authorization", .. }));

        let git = gh.bindings.iter().find(|b| b.matches("github.com")).unwrap();
        assert!(matches!(git.inject, InjectScheme::BasicAuthWithToken));
    }

    #[test]
    fn wildcard_excludes_apex() {
        let openai = find("openai").unwrap();
        let wildcard = openai
            .bindings
            .iter()
            .find(|b| b.host_pattern == "*.openai.com")
            .unwrap();
        assert!(wildcard.matches("chatgpt.openai.com"));
        assert!(!wildcard.matches("openai.com"));
    }

    #[test]
    fn unknown_provider_rejected() {
        assert!(require_known("not-a-real-provider").is_err());
    }

    #[test]
    fn mcp_prefixed_names_are_accepted_without_static_descriptor() {
        assert!(require_known("mcp-my-server").is_ok());
        assert!(find("mcp-my-server").is_none());
    }

    #[test]
    fn anthropic_carries_required_auxiliary_headers() {
        let anthropic = find("anthropic").unwrap();
        assert_eq!(anthropic.bindings.len(), 1);
        assert_eq!(anthropic.bindings[0].aux_headers, ANTHROPIC_AUX);
    }
}
