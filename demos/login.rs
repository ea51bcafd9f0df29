//! A login form's validation and submission logic, expressed purely in terms of the graph's
//! public API — no view layer, just the extent a view controller would bind to.
//!
//! A view controller supplies `email`/`password` keystrokes and a `login_click` tap, and reads
//! back `login_enabled` and `logging_in` to drive its own rendering. The network request a real
//! submit button would trigger is replaced by a caller-supplied closure, so the extent can be
//! driven headlessly in a test with no view layer at all.

use std::rc::Rc;

use behavior_graph::{ExtentBuilder, ExtentHandle, Graph, Moment, State};

#[derive(Clone, Copy)]
pub struct LoginExtent {
    pub email: State<String>,
    pub password: State<String>,
    pub login_click: Moment<()>,
    pub email_valid: State<bool>,
    pub password_valid: State<bool>,
    pub login_enabled: State<bool>,
    pub logging_in: State<bool>,
    pub login_complete: Moment<bool>,
}

fn is_valid_email(s: &str) -> bool {
    s.contains('@') && !s.is_empty()
}

fn is_valid_password(s: &str) -> bool {
    s.len() >= 8
}

/// Builds the extent's resources and behaviors. `attempt_login` is invoked (as a queued side
/// effect, never inline) when the user submits valid credentials; it should eventually call
/// [`LoginExtent::complete_login`] with the outcome once the login attempt finishes.
pub fn build(
    graph: &'static Graph,
    attempt_login: impl Fn(String, String) + 'static,
) -> ExtentHandle<LoginExtent> {
    let attempt_login: Rc<dyn Fn(String, String)> = Rc::new(attempt_login);
    graph.build_extent(|b: &ExtentBuilder| {
        let email = b.state(String::new());
        let password = b.state(String::new());
        let login_click = b.plain_resource();
        let email_valid = b.state(false);
        let password_valid = b.state(false);
        let login_enabled = b.state(false);
        let logging_in = b.state(false);
        let login_complete = b.moment::<bool>();

        b.behavior(&[email.id()], &[email_valid.id()], move |_g| {
            email_valid.update_value(is_valid_email(&email.value()));
        });

        b.behavior(&[password.id()], &[password_valid.id()], move |_g| {
            password_valid.update_value(is_valid_password(&password.value()));
        });

        b.behavior(
            &[email_valid.id(), password_valid.id(), logging_in.id()],
            &[login_enabled.id()],
            move |_g| {
                login_enabled.update_value(email_valid.value() && password_valid.value() && !logging_in.value());
            },
        );

        // Recomputes the same eligibility `login_enabled` displays, rather than demanding
        // `login_enabled` itself: `login_enabled` already demands `logging_in`, so a demand in
        // the other direction would be a cycle.
        b.behavior(
            &[
                login_click.id(),
                login_complete.id(),
                email_valid.id(),
                password_valid.id(),
            ],
            &[logging_in.id()],
            move |g| {
                if login_click.just_updated() && email_valid.value() && password_valid.value() && !logging_in.value() {
                    logging_in.update_value(true);
                    let (e, p) = (email.value(), password.value());
                    let attempt_login = attempt_login.clone();
                    g.side_effect(move || attempt_login(e, p));
                } else if login_complete.just_updated() {
                    logging_in.update_value(false);
                }
            },
        );

        LoginExtent {
            email,
            password,
            login_click,
            email_valid,
            password_valid,
            login_enabled,
            logging_in,
            login_complete,
        }
    })
}

impl LoginExtent {
    /// Reports the outcome of an in-flight login attempt. Must be called from inside its own
    /// action.
    pub fn complete_login(&self, success: bool) {
        self.login_complete.update_value(success);
    }
}
