use clap::ValueEnum;
use std::str::FromStr;

#[derive(Clone)]
pub enum Auth {
    /// Use an access token via a Bearer authorization header
    Bearer(String),
    /// Use username and password via Basic Auth headers
    Basic(String, String),
    /// Don't send an authorization header
    None,
}

impl Auth {
    pub fn new(
        r#type: &AuthType,
        username: Option<String>,
        password: Option<String>,
        token: Option<String>,
    ) -> Self {
        match (r#type, username, password, token) {
            (AuthType::Bearer, _, _, Some(token)) => Self::Bearer(token),
            (AuthType::Basic, Some(username), Some(password), _) => Self::Basic(username, password),
            (AuthType::None, _, _, _) | _ => Self::None,
        }
    }

    /// Pick the scheme from whichever credentials are present, token first
    pub fn detect(
        username: Option<String>,
        password: Option<String>,
        token: Option<String>,
    ) -> Self {
        let r#type = match (&username, &password, &token) {
            (_, _, Some(_)) => AuthType::Bearer,
            (Some(_), Some(_), None) => AuthType::Basic,
            _ => AuthType::None,
        };
        Self::new(&r#type, username, password, token)
    }
}

impl std::fmt::Display for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bearer(_) => write!(f, "Bearer"),
            Self::Basic(_, _) => write!(f, "Basic"),
            Self::None => write!(f, "None"),
        }
    }
}

// Credentials stay out of debug output
impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Auth::{}", self)
    }
}

#[derive(Clone, Debug, ValueEnum)]
pub enum AuthType {
    Bearer,
    Basic,
    None,
}

impl FromStr for AuthType {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "bearer" | "token" => Ok(Self::Bearer),
            "basic" => Ok(Self::Basic),
            "none" => Ok(Self::None),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_prefers_token() {
        let auth = Auth::detect(
            Some("user".into()),
            Some("pass".into()),
            Some("token".into()),
        );
        assert!(matches!(auth, Auth::Bearer(t) if t == "token"));

        let auth = Auth::detect(Some("user".into()), Some("pass".into()), None);
        assert!(matches!(auth, Auth::Basic(u, _) if u == "user"));

        let auth = Auth::detect(Some("user".into()), None, None);
        assert!(matches!(auth, Auth::None));
    }

    #[test]
    fn test_debug_hides_secrets() {
        let auth = Auth::Basic("user".into(), "hunter2".into());
        assert_eq!(format!("{:?}", auth), "Auth::Basic");
    }
}
