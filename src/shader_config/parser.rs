//! Line-oriented `key = value` parser (§4.8).

use super::*;
use crate::error::{ParseError, ParseErrorKind};

/// Parse shader-config source text into a [`ShaderConfigSource`].
///
/// Comments start with `;` or `#` and run to end of line (the source
/// documentation mentions only `;`; both are accepted as the safe choice,
/// per the design notes). Unknown keys warn (via `tracing::warn`) and are
/// ignored; malformed `key = value` lines warn and are skipped. Parsing
/// never fails outright except for hard limits (line/key/value length) and
/// invalid enum tokens for recognised keys.
pub fn parse(text: &str) -> Result<ShaderConfigSource, ParseError> {
    let mut source = ShaderConfigSource::default();

    for (line_idx, raw_line) in text.lines().enumerate() {
        let line_number = line_idx + 1;

        if raw_line.len() > MAX_LINE_LENGTH {
            return Err(ParseError::new(
                ParseErrorKind::BufferOverflow,
                line_number,
                0,
                format!("line exceeds {MAX_LINE_LENGTH} bytes"),
            ));
        }

        let line = strip_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some(eq_pos) = line.find('=') else {
            tracing::warn!(line = line_number, "malformed line (missing '='), skipping: {line}");
            continue;
        };

        let key_raw = line[..eq_pos].trim();
        let value_raw = line[eq_pos + 1..].trim();

        if key_raw.is_empty() {
            tracing::warn!(line = line_number, "malformed line (empty key), skipping");
            continue;
        }
        if key_raw.len() > MAX_KEY_LENGTH {
            return Err(ParseError::new(
                ParseErrorKind::BufferOverflow,
                line_number,
                0,
                format!("key exceeds {MAX_KEY_LENGTH} bytes"),
            ));
        }
        if value_raw.len() > MAX_VALUE_LENGTH {
            return Err(ParseError::new(
                ParseErrorKind::BufferOverflow,
                line_number,
                eq_pos,
                format!("value exceeds {MAX_VALUE_LENGTH} bytes"),
            ));
        }

        let key = key_raw.to_ascii_lowercase();
        apply_key(&mut source, &key, value_raw, line_number)?;
    }

    Ok(source)
}

fn strip_comment(line: &str) -> &str {
    let cut = line
        .char_indices()
        .find(|&(_, c)| c == ';' || c == '#')
        .map(|(i, _)| i);
    match cut {
        Some(i) => &line[..i],
        None => line,
    }
}

fn csv(value: &str) -> Vec<String> {
    value.split(',').map(|t| t.trim().to_string()).filter(|t| !t.is_empty()).collect()
}

fn apply_key(
    source: &mut ShaderConfigSource,
    key: &str,
    value: &str,
    line: usize,
) -> Result<(), ParseError> {
    match key {
        "name" => {
            if value.len() > SHADER_NAME_MAX_LENGTH {
                return Err(ParseError::new(
                    ParseErrorKind::InvalidValue,
                    line,
                    0,
                    format!("name exceeds {SHADER_NAME_MAX_LENGTH} characters"),
                ));
            }
            source.name = Some(value.to_string());
        }
        "renderpass" => {
            source.renderpass = Some(value.to_string());
        }
        "stages" => {
            let mut kinds = Vec::new();
            for tok in csv(value) {
                match tok.to_ascii_lowercase().as_str() {
                    "vertex" => kinds.push(StageKind::Vertex),
                    "fragment" => kinds.push(StageKind::Fragment),
                    other => {
                        return Err(ParseError::new(
                            ParseErrorKind::InvalidValue,
                            line,
                            0,
                            format!("unknown shader stage '{other}'"),
                        ));
                    }
                }
            }
            source.stage_kinds = kinds;
        }
        "stagefiles" => {
            source.stage_files = csv(value);
        }
        "attribute" => {
            if source.raw_attributes.len() >= MAX_ATTRIBUTES {
                return Err(ParseError::new(
                    ParseErrorKind::BufferOverflow,
                    line,
                    0,
                    format!("more than {MAX_ATTRIBUTES} attributes declared"),
                ));
            }
            let parts = csv(value);
            if parts.len() != 2 {
                return Err(ParseError::new(
                    ParseErrorKind::InvalidFormat,
                    line,
                    0,
                    "attribute requires '<type>,<name>'",
                ));
            }
            let attr_type = AttributeType::from_token(&parts[0].to_ascii_lowercase()).ok_or_else(|| {
                ParseError::new(ParseErrorKind::InvalidValue, line, 0, format!("unknown attribute type '{}'", parts[0]))
            })?;
            source.raw_attributes.push((attr_type, parts[1].clone()));
        }
        "uniform" => {
            if source.raw_uniforms.len() >= MAX_UNIFORMS {
                return Err(ParseError::new(
                    ParseErrorKind::BufferOverflow,
                    line,
                    0,
                    format!("more than {MAX_UNIFORMS} uniforms declared"),
                ));
            }
            let parts = csv(value);
            if parts.len() != 3 {
                return Err(ParseError::new(
                    ParseErrorKind::InvalidFormat,
                    line,
                    0,
                    "uniform requires '<type>,<scope>,<name>'",
                ));
            }
            let uniform_type = UniformType::from_token(&parts[0].to_ascii_lowercase()).ok_or_else(|| {
                ParseError::new(ParseErrorKind::InvalidValue, line, 0, format!("unknown uniform type '{}'", parts[0]))
            })?;
            let scope = UniformScope::from_token(parts[1].trim()).ok_or_else(|| {
                ParseError::new(ParseErrorKind::InvalidValue, line, 0, format!("uniform scope out of [0,2]: '{}'", parts[1]))
            })?;
            source.raw_uniforms.push((uniform_type, scope, parts[2].clone()));
        }
        "use_instance" => {
            source.use_instance = parse_bool(value, line)?;
        }
        "use_local" => {
            source.use_local = parse_bool(value, line)?;
        }
        "cull_mode" => {
            source.cull_mode = CullMode::from_token(&value.to_ascii_lowercase()).ok_or_else(|| {
                ParseError::new(ParseErrorKind::InvalidValue, line, 0, format!("unknown cull_mode '{value}'"))
            })?;
        }
        "version" => {
            tracing::info!(line, version = value, "shader config version");
            source.version = Some(value.to_string());
        }
        other => {
            tracing::warn!(line, key = other, "unknown shader config key, ignoring");
        }
    }
    Ok(())
}

fn parse_bool(value: &str, line: usize) -> Result<bool, ParseError> {
    match value.trim() {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(ParseError::new(ParseErrorKind::InvalidValue, line, 0, format!("expected 0 or 1, got '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
name = default.world
renderpass = Renderpass.Builtin.World
stages = vertex, fragment
stagefiles = default.world.spv
attribute = vec3, in_position
attribute = vec3, in_normal
attribute = vec2, in_texcoord
uniform = mat4, 0, view
uniform = mat4, 0, projection
uniform = vec4, 1, diffuse_color
uniform = samp,  1, diffuse_texture
use_instance = 1
use_local = 1
cull_mode = back
"#;

    #[test]
    fn parses_example_world_shader() {
        let source = parse(EXAMPLE).unwrap();
        assert_eq!(source.name.as_deref(), Some("default.world"));
        assert_eq!(source.renderpass.as_deref(), Some("Renderpass.Builtin.World"));
        assert_eq!(source.stage_kinds, vec![StageKind::Vertex, StageKind::Fragment]);
        assert_eq!(source.raw_attributes.len(), 3);
        assert_eq!(source.raw_uniforms.len(), 4);
        assert!(source.use_instance);
        assert!(source.use_local);
        assert_eq!(source.cull_mode, CullMode::Back);
    }

    #[test]
    fn hash_comment_is_accepted_alongside_semicolon() {
        let text = "name = foo # trailing comment\nstages = vertex\n; a full-line comment\nrenderpass = bar\n";
        let source = parse(text).unwrap();
        assert_eq!(source.name.as_deref(), Some("foo"));
        assert_eq!(source.renderpass.as_deref(), Some("bar"));
    }

    #[test]
    fn duplicate_name_and_renderpass_overwrite_silently() {
        let text = "name = first\nname = second\nrenderpass = a\nrenderpass = b\nstages = vertex\n";
        let source = parse(text).unwrap();
        assert_eq!(source.name.as_deref(), Some("second"));
        assert_eq!(source.renderpass.as_deref(), Some("b"));
    }

    #[test]
    fn unknown_key_is_ignored_not_fatal() {
        let text = "name = foo\nstages = vertex\ntotally_unknown_key = 123\n";
        let source = parse(text).unwrap();
        assert_eq!(source.name.as_deref(), Some("foo"));
    }

    #[test]
    fn malformed_line_without_equals_is_skipped_not_fatal() {
        let text = "name = foo\nstages = vertex\nthis line has no equals sign\n";
        let source = parse(text).unwrap();
        assert_eq!(source.name.as_deref(), Some("foo"));
    }

    #[test]
    fn invalid_stage_token_is_rejected() {
        let text = "stages = vertex, compute\n";
        let err = parse(text).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::InvalidValue);
    }

    #[test]
    fn invalid_scope_token_is_rejected() {
        let text = "uniform = vec4, 3, foo\n";
        let err = parse(text).unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::InvalidValue);
    }
}
