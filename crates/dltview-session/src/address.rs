use std::path::{Component, Path, PathBuf};

/// The files behind one logical recording address.
///
/// Several files of the same directory are addressed as one path: the
/// primary file followed by the companion file names, e.g.
/// `/logs/a.dlt/b.dlt/c.dlt` for `a.dlt`, `b.dlt` and `c.dlt` in `/logs`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileAddress {
    pub primary: PathBuf,
    pub companions: Vec<PathBuf>,
}

impl FileAddress {
    pub fn single(path: impl Into<PathBuf>) -> Self {
        Self {
            primary: path.into(),
            companions: Vec::new(),
        }
    }

    /// Splits `address` into primary and companions.
    ///
    /// The primary is the shortest prefix of `address` that `is_file`
    /// accepts; every remaining component has to be a file next to it.
    /// Anything else is taken as a single file.
    pub fn parse(address: &str, is_file: impl Fn(&Path) -> bool) -> Self {
        let path = Path::new(address);
        let components: Vec<Component<'_>> = path.components().collect();
        let mut prefix = PathBuf::new();
        for (pos, component) in components.iter().enumerate() {
            prefix.push(component.as_os_str());
            if !matches!(component, Component::Normal(_)) || !is_file(&prefix) {
                continue;
            }
            let rest = &components[pos + 1..];
            if rest.is_empty() {
                return Self::single(prefix);
            }
            let dir = prefix.parent().map(Path::to_path_buf).unwrap_or_default();
            let mut companions = Vec::with_capacity(rest.len());
            for name in rest {
                let Component::Normal(name) = name else {
                    return Self::single(path);
                };
                let companion = dir.join(name);
                if !is_file(&companion) {
                    return Self::single(path);
                }
                companions.push(companion);
            }
            return Self {
                primary: prefix,
                companions,
            };
        }
        Self::single(path)
    }

    pub fn parse_local(address: &str) -> Self {
        Self::parse(address, Path::is_file)
    }

    /// Inverse of [`FileAddress::parse`]. `None` if a companion lives in
    /// another directory than the primary.
    pub fn encode(&self) -> Option<String> {
        let dir = self.primary.parent();
        let mut out = self.primary.clone();
        for companion in &self.companions {
            if companion.parent() != dir {
                return None;
            }
            out.push(companion.file_name()?);
        }
        Some(out.to_string_lossy().into_owned())
    }

    /// All files, primary first, as sent in `open`.
    pub fn files(&self) -> Vec<String> {
        std::iter::once(&self.primary)
            .chain(&self.companions)
            .map(|p| p.to_string_lossy().into_owned())
            .collect()
    }
}
