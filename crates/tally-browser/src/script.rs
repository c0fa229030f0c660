//! JavaScript snippets for locating and driving elements
//!
//! Non-CSS locators (link text, button text) have no CDP equivalent, so every
//! locator is rendered to a finder expression that evaluates to the element or `null`.

use tally_core::Locator;

fn js_string(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// Expression evaluating to the first matching element, or `null`
pub fn finder_expression(locator: &Locator) -> String {
    match locator {
        Locator::Css(selector) => format!("document.querySelector({})", js_string(selector)),
        Locator::LinkText(text) => format!(
            "(Array.from(document.querySelectorAll('a')).find(e => (e.innerText || e.textContent || '').trim() === {}) || null)",
            js_string(text)
        ),
        Locator::PartialLinkText(text) => format!(
            "(Array.from(document.querySelectorAll('a')).find(e => (e.innerText || e.textContent || '').includes({})) || null)",
            js_string(text)
        ),
        Locator::ButtonText(text) => format!(
            "(Array.from(document.querySelectorAll('button, input[type=submit], input[type=button]')).find(e => (e.innerText || e.value || '').includes({})) || null)",
            js_string(text)
        ),
    }
}

/// Evaluates to `true` when the locator matches
pub fn exists_script(locator: &Locator) -> String {
    format!(
        "(function() {{ const el = {}; return el !== null && el !== undefined; }})()",
        finder_expression(locator)
    )
}

/// Clicks the element; evaluates to `false` when nothing matched
pub fn click_script(locator: &Locator) -> String {
    format!(
        "(function() {{ const el = {}; if (!el) {{ return false; }} if (el.scrollIntoView) {{ el.scrollIntoView({{block: 'center'}}); }} el.click(); return true; }})()",
        finder_expression(locator)
    )
}

/// Visible text of the element, or `null`
pub fn text_script(locator: &Locator) -> String {
    format!(
        "(function() {{ const el = {}; return el ? (el.innerText || el.textContent || el.value || '') : null; }})()",
        finder_expression(locator)
    )
}

/// Sets an input's value and fires `input`/`change`; evaluates to `false` when nothing matched
pub fn set_value_script(locator: &Locator, value: &str) -> String {
    format!(
        "(function() {{ const el = {}; if (!el) {{ return false; }} el.value = {}; el.dispatchEvent(new Event('input', {{bubbles: true}})); el.dispatchEvent(new Event('change', {{bubbles: true}})); return true; }})()",
        finder_expression(locator),
        js_string(value)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_css_finder() {
        assert_eq!(
            finder_expression(&Locator::css("#Company_code")),
            r##"document.querySelector("#Company_code")"##
        );
    }

    #[test]
    fn test_link_text_is_exact_match() {
        let js = finder_expression(&Locator::link_text("Excel"));
        assert!(js.contains("querySelectorAll('a')"));
        assert!(js.contains(r#".trim() === "Excel""#));
    }

    #[test]
    fn test_partial_link_text_uses_includes() {
        let js = finder_expression(&Locator::partial_link_text("Excel"));
        assert!(js.contains(r#".includes("Excel")"#));
    }

    #[test]
    fn test_button_text_covers_submit_inputs() {
        let js = finder_expression(&Locator::button_text("View"));
        assert!(js.contains("input[type=submit]"));
        assert!(js.contains(r#".includes("View")"#));
    }

    #[test]
    fn test_values_are_escaped() {
        let js = set_value_script(&Locator::css("input[name='q']"), "a\"b\\c");
        assert!(js.contains(r#"document.querySelector("input[name='q']")"#));
        assert!(js.contains(r#"el.value = "a\"b\\c""#));
    }

    #[test]
    fn test_click_script_reports_missing() {
        let js = click_script(&Locator::css("#go"));
        assert!(js.contains("return false"));
        assert!(js.contains("el.click()"));
    }

    #[test]
    fn test_exists_and_text_wrap_finder() {
        let locator = Locator::css("#x");
        assert!(exists_script(&locator).contains(&finder_expression(&locator)));
        assert!(text_script(&locator).contains("innerText"));
    }
}
