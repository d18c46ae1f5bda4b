use sudo::RunningAs;

/// Who is running this process, as far as distro installs are concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invoker {
    /// Effective uid is 0 (includes sudo).
    pub effective_root: bool,
    /// Real root login, not a sudo invocation.
    pub true_root: bool,
    /// The user on whose behalf we run (`SUDO_USER` when elevated).
    pub user: Option<String>,
}

impl Invoker {
    pub fn current(sudo_user: Option<&str>) -> Self {
        let effective_root = matches!(sudo::check(), RunningAs::Root);
        let real_root = nix::unistd::getuid().is_root();
        let login = nix::unistd::User::from_uid(nix::unistd::getuid())
            .ok()
            .flatten()
            .map(|u| u.name);
        Invoker {
            effective_root,
            true_root: real_root && sudo_user.is_none(),
            user: sudo_user.map(str::to_string).or(login),
        }
    }

    pub fn root() -> Self {
        Invoker {
            effective_root: true,
            true_root: true,
            user: Some("root".to_string()),
        }
    }

    pub fn via_sudo(user: &str) -> Self {
        Invoker {
            effective_root: true,
            true_root: false,
            user: Some(user.to_string()),
        }
    }

    pub fn unprivileged(user: &str) -> Self {
        Invoker {
            effective_root: false,
            true_root: false,
            user: Some(user.to_string()),
        }
    }
}
