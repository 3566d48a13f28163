//! `files` object exposed to templates
//!
//! ```jinja2
//! {{ files.get("config/app.conf") | b64encode }}
//! {% if files.exists("config/extra.yaml") %}...{% endif %}
//! {% for f in files.glob("config/*.yaml") %}{{ f.name }}: {{ f.content | quote }}{% endfor %}
//! {% for line in files.lines("hosts.txt") %}- {{ line }}{% endfor %}
//! ```
//!
//! Only non-template package files are visible.

use std::sync::Arc;

use minijinja::value::{Enumerator, Object, ObjectRepr, Value};
use minijinja::{Error, ErrorKind, State};
use rudder_core::{FileEntry, PackageFiles};

#[derive(Debug)]
pub struct FilesObject {
    files: PackageFiles,
}

impl FilesObject {
    pub fn new(files: PackageFiles) -> Self {
        Self { files }
    }

    /// Wrap into a template value
    pub fn into_value(self) -> Value {
        Value::from_object(self)
    }
}

fn path_arg(args: &[Value], method: &str) -> Result<String, Error> {
    match args {
        [path] => path.as_str().map(str::to_string),
        _ => None,
    }
    .ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("files.{}() takes exactly one path argument", method),
        )
    })
}

fn access_error(err: rudder_core::CoreError) -> Error {
    Error::new(ErrorKind::InvalidOperation, err.to_string())
}

impl Object for FilesObject {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn call_method(
        self: &Arc<Self>,
        _state: &State,
        method: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        match method {
            "get" => {
                let path = path_arg(args, method)?;
                self.files.get(&path).map(Value::from).map_err(access_error)
            }
            "exists" => Ok(Value::from(self.files.exists(&path_arg(args, method)?))),
            "lines" => {
                let path = path_arg(args, method)?;
                self.files.lines(&path).map(Value::from).map_err(access_error)
            }
            "glob" => {
                let pattern = path_arg(args, method)?;
                let entries = self.files.glob(&pattern).map_err(access_error)?;
                Ok(Value::from(
                    entries
                        .into_iter()
                        .map(|entry| Value::from_object(EntryObject(entry)))
                        .collect::<Vec<_>>(),
                ))
            }
            _ => Err(Error::new(
                ErrorKind::UnknownMethod,
                format!("files has no method '{}' (available: get, exists, lines, glob)", method),
            )),
        }
    }
}

/// One `files.glob` match
#[derive(Debug)]
struct EntryObject(FileEntry);

impl Object for EntryObject {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Map
    }

    fn get_value(self: &Arc<Self>, key: &Value) -> Option<Value> {
        match key.as_str()? {
            "path" => Some(Value::from(self.0.path.clone())),
            "name" => Some(Value::from(self.0.name.clone())),
            "content" => Some(Value::from(self.0.content.clone())),
            "size" => Some(Value::from(self.0.size)),
            _ => None,
        }
    }

    fn enumerate(self: &Arc<Self>) -> Enumerator {
        Enumerator::Str(&["path", "name", "content", "size"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::Environment;
    use std::collections::BTreeMap;

    fn render(template: &str) -> Result<String, Error> {
        let mut files = BTreeMap::new();
        files.insert("config/a.yaml".to_string(), "a: 1".to_string());
        files.insert("config/b.yaml".to_string(), "b: 2".to_string());
        files.insert("hosts.txt".to_string(), "one\ntwo".to_string());

        let env = Environment::new();
        env.render_str(
            template,
            minijinja::context! { files => FilesObject::new(PackageFiles::new(files)).into_value() },
        )
    }

    #[test]
    fn test_get_and_exists() {
        assert_eq!(render(r#"{{ files.get("config/a.yaml") }}"#).unwrap(), "a: 1");
        assert_eq!(render(r#"{{ files.exists("nope.txt") }}"#).unwrap(), "false");
        assert!(render(r#"{{ files.get("../secret") }}"#).is_err());
    }

    #[test]
    fn test_glob_and_lines() {
        let out = render(r#"{% for f in files.glob("config/*.yaml") %}{{ f.name }};{% endfor %}"#).unwrap();
        assert_eq!(out, "a.yaml;b.yaml;");

        let out = render(r#"{{ files.lines("hosts.txt") | join(",") }}"#).unwrap();
        assert_eq!(out, "one,two");
    }

    #[test]
    fn test_unknown_method() {
        assert!(render(r#"{{ files.read("x") }}"#).is_err());
    }
}
