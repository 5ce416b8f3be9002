//! `meshcheck list`

use crate::scenarios::Suite;
use crate::Result;

/// Render every suite and its cases
pub fn render() -> String {
    let mut out = String::new();
    for suite in Suite::ALL {
        out.push_str(&format!("{}: {}\n", suite.name(), suite.description()));
        for case in suite.cases() {
            out.push_str(&format!("    {}\n", case.name));
        }
    }
    out
}

pub fn run() -> Result<()> {
    print!("{}", render());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_every_suite_and_case() {
        let out = render();
        for suite in Suite::ALL {
            assert!(out.contains(&format!("{}: ", suite.name())));
        }
        // 4 + 4 + 2 cases, 3 suite headers
        assert_eq!(out.lines().count(), 13);
        assert!(out.contains("    mirror k8s namespaces; secure\n"));
    }
}
