// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Built-in `substitute` interpreter: find/replace rules written in TOML.
//!
//! ```toml
//! [[request]]
//! find = "User-Agent: curl"
//! replace = "User-Agent: proxenet/{request_id}"
//!
//! [[response]]
//! find = "Server: nginx"
//! replace = "Server: hidden"
//! ```

use serde::Deserialize;
use std::path::Path;

use super::interpreter::{Direction, Interpreter, InterpreterKind};

const REQUEST_ID_TOKEN: &str = "{request_id}";

#[derive(Debug, Clone, Deserialize)]
struct Rule {
    find: String,
    replace: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Script {
    #[serde(default)]
    request: Vec<Rule>,
    #[serde(default)]
    response: Vec<Rule>,
}

pub struct Substitute;

impl InterpreterKind for Substitute {
    fn name(&self) -> &str {
        "substitute"
    }

    fn extension(&self) -> &str {
        "sub"
    }

    fn spawn(&self, script: &Path, source: &str) -> anyhow::Result<Box<dyn Interpreter>> {
        let parsed: Script = toml::from_str(source)
            .map_err(|e| anyhow::anyhow!("{}: {}", script.display(), e))?;
        if let Some(rule) = parsed
            .request
            .iter()
            .chain(parsed.response.iter())
            .find(|r| r.find.is_empty())
        {
            anyhow::bail!(
                "{}: empty `find` (replacement {:?})",
                script.display(),
                rule.replace
            );
        }
        Ok(Box::new(SubstituteVm { script: parsed }))
    }
}

struct SubstituteVm {
    script: Script,
}

/// Every occurrence of `find` replaced, or `None` if there was none.
fn replace_all(haystack: &[u8], find: &[u8], replace: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    let mut hit = false;
    while let Some(pos) = rest.windows(find.len()).position(|w| w == find) {
        out.extend_from_slice(&rest[..pos]);
        out.extend_from_slice(replace);
        rest = &rest[pos + find.len()..];
        hit = true;
    }
    if !hit {
        return None;
    }
    out.extend_from_slice(rest);
    Some(out)
}

impl Interpreter for SubstituteVm {
    fn call(
        &mut self,
        entry: Direction,
        request_id: u64,
        buffer: &[u8],
    ) -> anyhow::Result<Option<Vec<u8>>> {
        let rules = match entry {
            Direction::Request => &self.script.request,
            Direction::Response => &self.script.response,
        };

        let mut current: Option<Vec<u8>> = None;
        for rule in rules {
            let replacement = rule
                .replace
                .replace(REQUEST_ID_TOKEN, &request_id.to_string());
            let input = current.as_deref().unwrap_or(buffer);
            if let Some(next) = replace_all(input, rule.find.as_bytes(), replacement.as_bytes()) {
                current = Some(next);
            }
        }
        Ok(current)
    }
}
