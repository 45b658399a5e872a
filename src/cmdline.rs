//! Kernel command line synthesis.
//!
//! The final command line is built from ordered layers, lowest precedence
//! first:
//!
//! 1. parameters inherited from the running kernel (allow-listed keys only)
//! 2. the boot entry's own `APPEND` parameters
//! 3. the distribution's rendered `kernel_params` template
//! 4. caller overrides
//! 5. [`FIXED_SUFFIX`]
//!
//! A `key=value` (or bare `key`) token in a later layer replaces the tokens
//! with the same key from earlier layers, keeping the position of the first
//! one. The suffix is the exception: it removes earlier tokens with its keys
//! and always comes last. Repeated keys inside one layer are left alone
//! (`console=` is legitimately repeated).
//!
//! Templates understand `{{device}}`, `{{uuid}}`, `{{mount_point}}` and
//! `{{image_path}}`, filled from a [`CacheDevice`]. A value with whitespace
//! is double-quoted so it stays one kernel argument.

use std::fs;

use crate::bootconfig::BootEntry;
use crate::cache::CacheDevice;
use crate::error::TemplateError;

/// Appended to every composed command line.
pub const FIXED_SUFFIX: &str = "waitusb=10 rootdelay=5";

/// Render a parameter template against `device`.
pub fn render_template(template: &str, device: &CacheDevice) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    loop {
        let open = rest.find("{{");
        let close = rest.find("}}");

        if let Some(c) = close {
            if open.map_or(true, |o| c < o) {
                return Err(TemplateError::StrayClose { offset: offset + c });
            }
        }
        let Some(o) = open else {
            out.push_str(rest);
            return Ok(out);
        };

        out.push_str(&rest[..o]);
        let inner = &rest[o + 2..];
        let end = inner
            .find("}}")
            .ok_or(TemplateError::Unterminated { offset: offset + o })?;

        let name = inner[..end].trim();
        if name.is_empty() {
            return Err(TemplateError::EmptyPlaceholder { offset: offset + o });
        }
        let value = match name {
            "device" => &device.name,
            "uuid" => &device.uuid,
            "mount_point" => &device.mount_point,
            "image_path" => &device.image_path,
            other => {
                return Err(TemplateError::UnknownPlaceholder {
                    name: other.to_string(),
                    offset: offset + o,
                })
            }
        };
        if value.contains('"') {
            return Err(TemplateError::UnquotableValue {
                name: name.to_string(),
                offset: offset + o,
            });
        }
        if value.chars().any(char::is_whitespace) {
            out.push('"');
            out.push_str(value);
            out.push('"');
        } else {
            out.push_str(value);
        }

        let consumed = o + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
}

/// `<entry parameters> <rendered template> <FIXED_SUFFIX>`.
pub fn compose(
    entry: &BootEntry,
    template: &str,
    device: &CacheDevice,
) -> Result<String, TemplateError> {
    Composer::new().compose(entry, template, device)
}

/// Command line builder with inherited parameters and overrides.
#[derive(Debug, Clone, Default)]
pub struct Composer {
    inherited: Vec<String>,
    overrides: Vec<String>,
}

impl Composer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy tokens whose key is in `keys` from `host_cmdline`.
    pub fn inherit(mut self, keys: &[String], host_cmdline: &str) -> Self {
        self.inherited = split_params(host_cmdline)
            .into_iter()
            .filter(|token| keys.iter().any(|k| param_key(token) == Some(k.as_str())))
            .collect();
        self
    }

    /// [`Composer::inherit`] from `/proc/cmdline`. An unreadable file
    /// inherits nothing.
    pub fn inherit_from_host(self, keys: &[String]) -> Self {
        if keys.is_empty() {
            return self;
        }
        match fs::read_to_string("/proc/cmdline") {
            Ok(raw) => self.inherit(keys, &raw),
            Err(e) => {
                tracing::warn!("cannot read /proc/cmdline, inheriting nothing: {}", e);
                self
            }
        }
    }

    /// Caller parameters; may contain template placeholders.
    pub fn overrides<S: AsRef<str>>(mut self, params: &[S]) -> Self {
        self.overrides = params
            .iter()
            .flat_map(|p| split_params(p.as_ref()))
            .collect();
        self
    }

    pub fn compose(
        &self,
        entry: &BootEntry,
        template: &str,
        device: &CacheDevice,
    ) -> Result<String, TemplateError> {
        let rendered = render_template(template, device)?;
        let overrides = self
            .overrides
            .iter()
            .map(|p| render_template(p, device))
            .collect::<Result<Vec<_>, _>>()?;

        let mut line = Layered::default();
        line.apply(0, &self.inherited);
        line.apply(1, &split_params(&entry.parameters));
        line.apply(2, &split_params(&rendered));
        line.apply(3, &overrides);
        line.apply_trailing(4, &split_params(FIXED_SUFFIX));

        let composed = line.render();
        tracing::debug!("composed command line: {}", composed);
        Ok(composed)
    }
}

#[derive(Debug, Default)]
struct Layered {
    tokens: Vec<(usize, String)>,
}

impl Layered {
    fn apply(&mut self, layer: usize, tokens: &[String]) {
        for token in tokens {
            self.push(layer, token);
        }
    }

    /// Like [`Layered::apply`] but the tokens always end up last.
    fn apply_trailing(&mut self, layer: usize, tokens: &[String]) {
        for token in tokens {
            if let Some(key) = param_key(token) {
                self.tokens
                    .retain(|(l, t)| !(*l < layer && param_key(t) == Some(key)));
            }
            self.tokens.push((layer, token.clone()));
        }
    }

    fn push(&mut self, layer: usize, token: &str) {
        let Some(key) = param_key(token) else {
            self.tokens.push((layer, token.to_string()));
            return;
        };

        let mut replaced = false;
        let mut i = 0;
        while i < self.tokens.len() {
            let (existing_layer, existing) = &self.tokens[i];
            if *existing_layer < layer && param_key(existing) == Some(key) {
                if replaced {
                    self.tokens.remove(i);
                    continue;
                }
                self.tokens[i] = (layer, token.to_string());
                replaced = true;
            }
            i += 1;
        }
        if !replaced {
            self.tokens.push((layer, token.to_string()));
        }
    }

    fn render(&self) -> String {
        self.tokens
            .iter()
            .map(|(_, t)| t.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Key of a kernel parameter; `None` for separators such as `--`.
fn param_key(token: &str) -> Option<&str> {
    if token.chars().all(|c| c == '-') {
        return None;
    }
    Some(token.split('=').next().unwrap_or(token))
}

/// Split on whitespace outside double quotes.
fn split_params(raw: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;

    for c in raw.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn device() -> CacheDevice {
        CacheDevice {
            name: "sdb1".to_string(),
            uuid: "1234-ABCD".to_string(),
            mount_point: "/media/usb".to_string(),
            image_path: "/isos/core.iso".to_string(),
        }
    }

    fn entry(params: &str) -> BootEntry {
        BootEntry {
            label: "live".to_string(),
            display: None,
            kernel_path: PathBuf::from("/mnt/boot/vmlinuz"),
            initrd_paths: vec![],
            parameters: params.to_string(),
            source_config: PathBuf::from("/mnt/isolinux/isolinux.cfg"),
        }
    }

    #[test]
    fn test_renders_placeholders() {
        let out = render_template(
            "iso=UUID={{uuid}}{{image_path}} dev=/dev/{{ device }} at={{mount_point}}",
            &device(),
        )
        .unwrap();
        assert_eq!(
            out,
            "iso=UUID=1234-ABCD/isos/core.iso dev=/dev/sdb1 at=/media/usb"
        );
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let template = "a={{uuid}} b={{device}} c={{image_path}}";
        let first = render_template(template, &device()).unwrap();
        for _ in 0..10 {
            assert_eq!(render_template(template, &device()).unwrap(), first);
        }

        let composer = Composer::new()
            .inherit(&["console".to_string(), "lang".to_string()], "lang=de console=ttyS0 quiet")
            .overrides(&["x=1", "y"]);
        let first = composer.compose(&entry("quiet"), template, &device()).unwrap();
        for _ in 0..10 {
            assert_eq!(
                composer.compose(&entry("quiet"), template, &device()).unwrap(),
                first
            );
        }
    }

    #[test]
    fn test_template_errors() {
        let dev = device();
        assert_eq!(
            render_template("a={{label}}", &dev),
            Err(TemplateError::UnknownPlaceholder {
                name: "label".to_string(),
                offset: 2
            })
        );
        assert_eq!(
            render_template("a={{uuid", &dev),
            Err(TemplateError::Unterminated { offset: 2 })
        );
        assert_eq!(
            render_template("x {{  }}", &dev),
            Err(TemplateError::EmptyPlaceholder { offset: 2 })
        );
        assert_eq!(
            render_template("{{uuid}} b}}", &dev),
            Err(TemplateError::StrayClose { offset: 10 })
        );
    }

    #[test]
    fn test_compose_without_template_appends_suffix() {
        let out = compose(&entry("quiet"), "", &device()).unwrap();
        assert_eq!(out, format!("quiet {FIXED_SUFFIX}"));
    }

    #[test]
    fn test_compose_orders_entry_template_suffix() {
        let out = compose(&entry("boot=live quiet"), "findiso={{image_path}}", &device()).unwrap();
        assert_eq!(
            out,
            "boot=live quiet findiso=/isos/core.iso waitusb=10 rootdelay=5"
        );

        let out = compose(&entry(""), "", &CacheDevice::default()).unwrap();
        assert_eq!(out, FIXED_SUFFIX);
    }

    #[test]
    fn test_later_layers_replace_by_key() {
        let composer = Composer::new()
            .inherit(&["console".to_string()], "BOOT_IMAGE=/vmlinuz console=ttyS0,115200 ro")
            .overrides(&["quiet=0", "rootdelay=30"]);
        let out = composer
            .compose(&entry("console=tty0 quiet splash"), "", &device())
            .unwrap();
        // entry console replaces inherited console in place; suffix beats override
        assert_eq!(out, "console=tty0 quiet=0 splash waitusb=10 rootdelay=5");
    }

    #[test]
    fn test_repeated_keys_within_a_layer_survive() {
        let out = compose(&entry("console=tty0 console=ttyS0 ---"), "", &device()).unwrap();
        assert_eq!(out, "console=tty0 console=ttyS0 --- waitusb=10 rootdelay=5");
    }

    #[test]
    fn test_overrides_may_use_placeholders() {
        let out = Composer::new()
            .overrides(&["iso-scan/filename={{image_path}}"])
            .compose(&entry(""), "", &device())
            .unwrap();
        assert_eq!(out, "iso-scan/filename=/isos/core.iso waitusb=10 rootdelay=5");
    }

    #[test]
    fn test_values_with_spaces_stay_one_argument() {
        let dev = CacheDevice {
            image_path: "/my isos/core.iso".to_string(),
            ..device()
        };
        let out = compose(&entry("quiet"), "iso={{image_path}}", &dev).unwrap();
        assert_eq!(out, r#"quiet iso="/my isos/core.iso" waitusb=10 rootdelay=5"#);

        let out = Composer::new()
            .overrides(&["findiso={{image_path}}"])
            .compose(&entry("iso=/entry.iso"), "iso={{image_path}}", &dev)
            .unwrap();
        assert_eq!(
            out,
            r#"iso="/my isos/core.iso" findiso="/my isos/core.iso" waitusb=10 rootdelay=5"#
        );

        let dev = CacheDevice {
            mount_point: "/media/a\"b".to_string(),
            ..device()
        };
        assert_eq!(
            render_template("at={{mount_point}}", &dev),
            Err(TemplateError::UnquotableValue {
                name: "mount_point".to_string(),
                offset: 3
            })
        );
    }

    #[test]
    fn test_quoted_values_stay_together() {
        assert_eq!(
            split_params(r#"a=1 b="x y" c"#),
            vec!["a=1".to_string(), r#"b="x y""#.to_string(), "c".to_string()]
        );
    }
}
