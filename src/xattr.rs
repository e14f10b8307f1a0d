//! Extended attribute names
//!
//! Maps `namespace.name` strings onto the attribute engine's namespaces.
//! Only the POSIX ACL names are accepted under `system.`.

use crate::eattr::{EaRequest, SetFlags};
use crate::error::{Error, Result};
use crate::fs::Gfs2Fs;
use crate::types::*;

const SYSTEM_NAMES: [&str; 2] = ["posix_acl_access", "posix_acl_default"];

/// Parse xattr name to extract namespace and base name
pub fn parse_xattr_name(name: &str) -> Result<(EaType, &str)> {
    let (ea_type, base) = if let Some(base) = name.strip_prefix("user.") {
        (EaType::User, base)
    } else if let Some(base) = name.strip_prefix("system.") {
        if !SYSTEM_NAMES.contains(&base) {
            return Err(Error::Unsupported(format!("system attribute '{}'", base)));
        }
        (EaType::System, base)
    } else if let Some(base) = name.strip_prefix("security.") {
        (EaType::Security, base)
    } else {
        return Err(Error::Unsupported(format!(
            "attribute '{}': must start with user., system. or security.",
            name
        )));
    };

    if base.is_empty() {
        return Err(Error::Invalid(format!("attribute '{}' has no name", name)));
    }
    Ok((ea_type, base))
}

/// Split a NUL-separated name list into strings
pub fn split_name_list(list: &[u8]) -> Vec<String> {
    list.split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

impl Gfs2Fs {
    pub fn getxattr(&self, addr: u64, name: &str) -> Result<Vec<u8>> {
        let (ea_type, base) = parse_xattr_name(name)?;
        self.ea_get(addr, ea_type, base.as_bytes())
    }

    pub fn setxattr(&self, addr: u64, name: &str, value: &[u8], flags: SetFlags) -> Result<()> {
        let (ea_type, base) = parse_xattr_name(name)?;
        let req = EaRequest::new(ea_type, base.as_bytes(), value).with_flags(flags);
        self.ea_set(addr, &req)
    }

    pub fn listxattr(&self, addr: u64) -> Result<Vec<String>> {
        Ok(split_name_list(&self.ea_list(addr)?))
    }

    pub fn removexattr(&self, addr: u64, name: &str) -> Result<()> {
        let (ea_type, base) = parse_xattr_name(name)?;
        self.ea_remove(addr, ea_type, base.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::testing::mem_fs;

    #[test]
    fn test_parse_xattr_name() {
        let (ns, name) = parse_xattr_name("user.foo").unwrap();
        assert_eq!(ns, EaType::User);
        assert_eq!(name, "foo");

        let (ns, name) = parse_xattr_name("security.selinux").unwrap();
        assert_eq!(ns, EaType::Security);
        assert_eq!(name, "selinux");

        let (ns, _) = parse_xattr_name("system.posix_acl_default").unwrap();
        assert_eq!(ns, EaType::System);

        assert!(matches!(
            parse_xattr_name("system.other"),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            parse_xattr_name("trusted.x"),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(parse_xattr_name("user."), Err(Error::Invalid(_))));
        assert!(parse_xattr_name("invalid").is_err());
    }

    #[test]
    fn test_xattr_calls() {
        let fs = mem_fs(4096, 1, 200);
        let ino = fs
            .create_inode(fs.root_addr(), mode::S_IFREG | 0o644, 0, 0)
            .unwrap();

        fs.setxattr(ino, "user.comment", b"hello", SetFlags::Any)
            .unwrap();
        fs.setxattr(ino, "security.label", b"l0", SetFlags::Create)
            .unwrap();
        assert_eq!(fs.getxattr(ino, "user.comment").unwrap(), b"hello");

        let mut names = fs.listxattr(ino).unwrap();
        names.sort();
        assert_eq!(names, vec!["security.label", "user.comment"]);

        fs.removexattr(ino, "user.comment").unwrap();
        assert!(matches!(
            fs.getxattr(ino, "user.comment"),
            Err(Error::NoData)
        ));
        assert_eq!(fs.listxattr(ino).unwrap(), vec!["security.label"]);
    }

    #[test]
    fn test_split_name_list() {
        assert_eq!(split_name_list(b"user.a\0system.b\0"), vec!["user.a", "system.b"]);
        assert!(split_name_list(b"").is_empty());
    }
}
