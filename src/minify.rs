//! Basic whitespace-level minification for the CAPTCHA challenge page.

/// Minifies HTML by collapsing newlines, tabs, and inter-tag whitespace.
#[must_use]
pub fn html(html: &str) -> String {
    html.replace('\n', "")
        .replace('\t', "")
        .replace("  ", " ")
        .replace("> <", "><")
        .replace(" />", "/>")
}

/// Minifies CSS by stripping whitespace around punctuation.
#[must_use]
pub fn css(css: &str) -> String {
    css.replace('\n', "")
        .replace('\t', "")
        .replace("  ", " ")
        .replace(" {", "{")
        .replace("{ ", "{")
        .replace(" }", "}")
        .replace("} ", "}")
        .replace(" ;", ";")
        .replace("; ", ";")
        .replace(" :", ":")
        .replace(": ", ":")
        .replace(", ", ",")
        .replace(";}", "}")
}

/// Minifies the small inline scripts on the challenge page. Not a general
/// JavaScript minifier.
#[must_use]
pub fn js(js: &str) -> String {
    js.replace('\n', "")
        .replace('\t', "")
        .replace("  ", " ")
        .replace(" => ", "=>")
        .replace(" {", "{")
        .replace("{ ", "{")
        .replace(" }", "}")
        .replace("} ", "}")
        .replace("true", "!0")
        .replace("false", "!1")
        .replace(" = ", "=")
}
