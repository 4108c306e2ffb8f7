//! Default diagnostic texts, keyed by (category, failed step, journey type).
//!
//! Everything here is a pure function from classification to prose. The
//! HTML fragments are safe to embed into an error page; every interpolated
//! value goes through [`html_escape`].

use stagehand_shared::category::ErrorCategory;
use stagehand_shared::constants::{PROGRAM_NAME, SHORT_PROGRAM_NAME, SUPPORT_URL};
use stagehand_shared::journey::{Journey, JourneyStep, JourneyType};

use crate::config::Config;

/// Minimal HTML entity escaping for text interpolated into diagnostics.
pub(crate) fn html_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// One-sentence summary of a failure.
///
/// Timeouts get a single journey-scoped sentence: the timeout applies to
/// the whole journey, and a timeout at one step may only mean an earlier
/// step ate the budget. Everything else names the failed activity.
pub(crate) fn default_summary(
    category: ErrorCategory,
    journey: &Journey,
    low_level_message: &str,
) -> String {
    if category == ErrorCategory::TimeoutError {
        return match journey.journey_type() {
            JourneyType::StartPreloader => {
                "A timeout occurred while starting a preloader process.".to_string()
            }
            _ => "A timeout occurred while spawning an application process.".to_string(),
        };
    }

    let phrase = category.phrase_with_article(true);
    let activity = failed_activity(journey);
    if low_level_message.is_empty() {
        format!("{phrase} occurred while {activity}.")
    } else {
        format!("{phrase} occurred while {activity}: {low_level_message}")
    }
}

fn failed_activity(journey: &Journey) -> &'static str {
    let step = journey.first_failed_step();
    if journey.journey_type() == JourneyType::StartPreloader {
        return match step {
            Some(JourneyStep::Preparation) => "preparing to start a preloader process",
            _ => "starting a preloader process",
        };
    }
    match step {
        Some(JourneyStep::Preparation) => "preparing to spawn an application process",
        Some(JourneyStep::ForkSubprocess) => "creating (forking) a subprocess",
        Some(JourneyStep::ConnectToPreloader) => "connecting to the preloader process",
        Some(JourneyStep::SendCommandToPreloader) => "sending a command to the preloader process",
        Some(JourneyStep::ReadResponseFromPreloader) => {
            "receiving a response from the preloader process"
        }
        Some(JourneyStep::ParseResponseFromPreloader) => {
            "parsing a response from the preloader process"
        }
        Some(JourneyStep::ProcessResponseFromPreloader) => {
            "processing a response from the preloader process"
        }
        _ => "spawning an application process",
    }
}

/// One-paragraph problem description naming who failed.
pub(crate) fn default_problem_html(
    category: ErrorCategory,
    journey: &Journey,
    low_level_message: &str,
) -> String {
    if category == ErrorCategory::TimeoutError {
        return format!(
            "<p>The {PROGRAM_NAME} application server tried to start the web \
             application, but this took too much time, so {SHORT_PROGRAM_NAME} \
             put a stop to that.</p>"
        );
    }

    let phrase = category.phrase_with_article(false);
    let starting_preloader = journey.journey_type() == JourneyType::StartPreloader;
    let message = match journey.first_failed_step() {
        Some(JourneyStep::Preparation) if starting_preloader => format!(
            "The {PROGRAM_NAME} application server tried to start the web \
             application. In doing so, {SHORT_PROGRAM_NAME} had to first start an \
             internal helper tool called the \"preloader\". But {SHORT_PROGRAM_NAME} \
             encountered {phrase} while performing this preparation work"
        ),
        Some(JourneyStep::Preparation) => format!(
            "The {PROGRAM_NAME} application server tried to start the web \
             application, but {SHORT_PROGRAM_NAME} encountered {phrase} while \
             performing preparation work"
        ),
        Some(JourneyStep::ForkSubprocess) => format!(
            "The {PROGRAM_NAME} application server tried to start the web \
             application. But {SHORT_PROGRAM_NAME} encountered {phrase} while \
             creating a subprocess"
        ),
        Some(JourneyStep::ConnectToPreloader) => preloader_comms_problem(&phrase, "connecting to"),
        Some(JourneyStep::SendCommandToPreloader) => {
            preloader_comms_problem(&phrase, "sending a command to")
        }
        Some(JourneyStep::ReadResponseFromPreloader) => {
            preloader_comms_problem(&phrase, "receiving a response from")
        }
        Some(JourneyStep::ParseResponseFromPreloader) => {
            preloader_comms_problem(&phrase, "parsing a response from")
        }
        Some(JourneyStep::ProcessResponseFromPreloader) => {
            preloader_comms_problem(&phrase, "processing a response from")
        }
        Some(JourneyStep::HandshakePerform) if starting_preloader => format!(
            "The {PROGRAM_NAME} application server tried to start the web \
             application. In doing so, {SHORT_PROGRAM_NAME} first started an \
             internal helper tool called the \"preloader\". But {SHORT_PROGRAM_NAME} \
             encountered {phrase} while communicating with this tool about its \
             startup"
        ),
        Some(JourneyStep::HandshakePerform) => format!(
            "The {PROGRAM_NAME} application server tried to start the web \
             application. Everything was looking OK, but then suddenly \
             {SHORT_PROGRAM_NAME} encountered {phrase}"
        ),
        Some(JourneyStep::BeforeFirstExec) => format!(
            "The {PROGRAM_NAME} application server tried to start the web \
             application. {SHORT_PROGRAM_NAME} launched a subprocess which was \
             supposed to execute the application, but instead that subprocess \
             encountered {phrase}"
        ),
        Some(JourneyStep::OsShell) => format!(
            "The {PROGRAM_NAME} application server tried to start the web \
             application through the operating system (OS) shell. But the OS \
             shell encountered {phrase}"
        ),
        Some(JourneyStep::SpawnEnvSetupperBeforeShell)
        | Some(JourneyStep::SpawnEnvSetupperAfterShell) => format!(
            "The {PROGRAM_NAME} application server tried to start the web \
             application through a {SHORT_PROGRAM_NAME}-internal helper tool \
             called the environment setupper. But that helper tool encountered \
             {phrase}"
        ),
        Some(JourneyStep::ExecWrapper) => format!(
            "The {PROGRAM_NAME} application server tried to start the web \
             application through a {SHORT_PROGRAM_NAME}-internal helper tool \
             called the \"wrapper\". But {SHORT_PROGRAM_NAME} was unable to \
             execute that helper tool because it encountered {phrase}"
        ),
        Some(JourneyStep::WrapperPreparation) => format!(
            "The {PROGRAM_NAME} application server tried to start the web \
             application through a {SHORT_PROGRAM_NAME}-internal helper tool \
             called the \"wrapper\". But that helper tool encountered {phrase}"
        ),
        Some(JourneyStep::AppLoadOrExec) => format!(
            "The {PROGRAM_NAME} application server tried to start the web \
             application. But the application itself (and not \
             {SHORT_PROGRAM_NAME}) encountered {phrase}"
        ),
        Some(JourneyStep::PrepareAfterForkingFromPreloader) => format!(
            "The {PROGRAM_NAME} application server tried to start the web \
             application through its preloader helper process. But the preloader \
             encountered {phrase} while preparing the forked process"
        ),
        Some(JourneyStep::Listen) => format!(
            "The {PROGRAM_NAME} application server tried to start the web \
             application. The application tried to setup a socket for accepting \
             connections, but in doing so it encountered {phrase}"
        ),
        _ => format!(
            "The {PROGRAM_NAME} application server tried to start the web \
             application, but encountered {phrase}"
        ),
    };

    wrap_in_para_with_message(&message, category, low_level_message)
}

fn preloader_comms_problem(phrase: &str, activity: &str) -> String {
    format!(
        "The {PROGRAM_NAME} application server tried to start the web \
         application by communicating with a helper process that we call a \
         \"preloader\". However, {SHORT_PROGRAM_NAME} encountered {phrase} while \
         {activity} this helper process"
    )
}

fn wrap_in_para_with_message(
    message: &str,
    category: ErrorCategory,
    low_level_message: &str,
) -> String {
    if low_level_message.is_empty() {
        return format!("<p>{message}.</p>");
    }
    let escaped = html_escape(low_level_message);
    match category {
        ErrorCategory::IoError => format!(
            "<p>{message}. The error reported by the I/O layer is:</p><pre>{escaped}</pre>"
        ),
        ErrorCategory::OperatingSystemError => format!(
            "<p>{message}. The error reported by the operating system is:</p><pre>{escaped}</pre>"
        ),
        _ => format!("<p>{message}:</p><pre>{escaped}</pre>"),
    }
}

/// Default remedy text for a failure.
pub(crate) fn default_solution_html(
    category: ErrorCategory,
    journey: &Journey,
    config: &Config,
) -> String {
    match category {
        ErrorCategory::InternalError | ErrorCategory::UnknownErrorCategory => format!(
            "<p class=\"sole-solution\">Unfortunately, {SHORT_PROGRAM_NAME} does \
             not know how to solve this problem. Please try troubleshooting the \
             problem by studying the <strong>error message</strong> and the \
             <strong>diagnostics</strong> reports. You can also consult \
             <a href=\"{SUPPORT_URL}\">the {SHORT_PROGRAM_NAME} support \
             resources</a> for help.</p>"
        ),

        ErrorCategory::FileSystemError => format!(
            "<p class=\"sole-solution\">Unfortunately, {SHORT_PROGRAM_NAME} does \
             not know how to solve this problem. But it looks like some kind of \
             filesystem error. This generally means that you need to fix \
             nonexistent files/directories or fix filesystem permissions. Please \
             try troubleshooting the problem by studying the <strong>error \
             message</strong> and the <strong>diagnostics</strong> reports.</p>"
        ),

        ErrorCategory::OperatingSystemError | ErrorCategory::IoError => format!(
            "<div class=\"multiple-solutions\">\
             <h3>Check whether the server is low on resources</h3>\
             <p>Maybe the server is currently low on resources. This would cause \
             errors to occur. Please study the <em>error message</em> and the \
             <em>diagnostics reports</em> to verify whether this is the case. Key \
             things to check for:</p>\
             <ul><li>Excessive CPU usage</li><li>Memory and swap</li>\
             <li>Ulimits</li></ul>\
             <p>If the server is indeed low on resources, find a way to free up \
             some resources.</p>\
             <h3>Check your (filesystem) security settings</h3>\
             <p>Maybe security settings are preventing {SHORT_PROGRAM_NAME} from \
             doing the work it needs to do. Please check whether the error may be \
             caused by your system's security settings, or whether it may be \
             caused by wrong permissions on a file or directory.</p>\
             <h3>Still no luck?</h3>\
             <p>Please try troubleshooting the problem by studying the \
             <em>diagnostics</em> reports.</p>\
             </div>"
        ),

        ErrorCategory::TimeoutError => timeout_solution_html(journey, config),
    }
}

fn timeout_solution_html(journey: &Journey, config: &Config) -> String {
    let mut message = format!(
        "<div class=\"multiple-solutions\">\
         <h3>Check whether the server is low on resources</h3>\
         <p>Maybe the server is currently so low on resources that all the work \
         that needed to be done, could not finish within the given time limit. \
         Please inspect the server resource utilization statistics in the \
         <em>diagnostics</em> section to verify whether server is indeed low on \
         resources.</p>\
         <p>If so, then either increase the spawn timeout (currently configured \
         at {} sec), or find a way to lower the server's resource \
         utilization.</p>",
        config.start_timeout_msec / 1000
    );

    match journey.first_failed_step() {
        Some(JourneyStep::OsShell) => {
            message.push_str(
                "<h3>Check whether your OS shell's startup scripts can take a \
                 long time or get stuck</h3>\
                 <p>One of your OS shell's startup scripts may do too much work, \
                 or it may have invoked a command that then got stuck. Please \
                 investigate and debug your OS shell's startup scripts.</p>",
            );
        }
        Some(JourneyStep::AppLoadOrExec) => {
            if config.app_type == "node" {
                message.push_str(&format!(
                    "<h3>Check whether the application calls \
                     <code>http.Server.listen()</code></h3>\
                     <p>{SHORT_PROGRAM_NAME} requires that the application calls \
                     <code>listen()</code> on an http.Server object. If the \
                     application never calls this, then {SHORT_PROGRAM_NAME} will \
                     think the application is stuck.</p>"
                ));
            }
            message.push_str(
                "<h3>Check whether the application is stuck during startup</h3>\
                 <p>The easiest way to find out where the application is stuck is \
                 by inserting print statements into the application's code.</p>",
            );
        }
        _ => {}
    }

    message.push_str(
        "<h3>Still no luck?</h3>\
         <p>Please try troubleshooting the problem by studying the \
         <em>diagnostics</em> reports.</p></div>",
    );
    message
}

// ---------------------------------------------------------------------------
// Canned texts for preloader protocol and validation failures
// ---------------------------------------------------------------------------

pub(crate) fn solution_report_bug_html() -> String {
    format!(
        "<p class=\"sole-solution\">This is a bug in {SHORT_PROGRAM_NAME}. \
         <a href=\"{SUPPORT_URL}\">Please report this bug</a> to the \
         {SHORT_PROGRAM_NAME} authors.</p>"
    )
}

pub(crate) fn solution_report_app_bug_html() -> String {
    format!(
        "<p class=\"sole-solution\">Since this is a bug in the web application, \
         please report this problem to the application's developer. This problem \
         is outside {SHORT_PROGRAM_NAME}'s control.</p>"
    )
}

pub(crate) fn solution_report_wrapper_bug_html(supplied_by_third_party: bool) -> String {
    if supplied_by_third_party {
        format!(
            "<p class=\"sole-solution\">The wrapper was supplied by a third \
             party, so this is probably a bug in that wrapper. Please report \
             this problem to the wrapper's author. This problem is outside \
             {SHORT_PROGRAM_NAME}'s control.</p>"
        )
    } else {
        solution_report_bug_html()
    }
}

pub(crate) fn solution_report_preloader_bug_html() -> String {
    format!(
        "<p class=\"sole-solution\">This is probably a bug in the preloader \
         process. <a href=\"{SUPPORT_URL}\">Please report this bug</a>.</p>"
    )
}

pub(crate) fn problem_preloader_gibberish_html() -> String {
    format!(
        "<p>The {PROGRAM_NAME} application server tried to start the web \
         application by communicating with a helper process that we call a \
         \"preloader\". However, this helper process sent a response that looks \
         like gibberish.</p>"
    )
}

pub(crate) fn problem_preloader_bad_structure_html(response: &str) -> String {
    format!(
        "<p>The {PROGRAM_NAME} application server tried to start the web \
         application by communicating with a helper process that we call a \
         \"preloader\". However, this helper process sent a response that does \
         not match the structure that {SHORT_PROGRAM_NAME} expects.</p>\
         <p>The response is as follows:</p><pre>{}</pre>",
        html_escape(response)
    )
}

pub(crate) fn problem_preloader_oversized_response_html() -> String {
    format!(
        "<p>The {PROGRAM_NAME} application server tried to start the web \
         application by communicating with a helper process that we call a \
         \"preloader\". However, this helper process sent a response that \
         exceeded the internally-defined maximum size limit.</p>"
    )
}

pub(crate) fn problem_preloader_reported_error_html(message: &str) -> String {
    format!(
        "<p>The {PROGRAM_NAME} application server tried to start the web \
         application by communicating with a helper process that we call a \
         \"preloader\". However, this helper process reported an \
         error:</p><pre>{}</pre>",
        html_escape(message)
    )
}

pub(crate) fn problem_preloader_wrong_uid_html(expected_uid: u32, actual_uid: u32) -> String {
    format!(
        "<p>The {PROGRAM_NAME} application server tried to start the web \
         application by communicating with a helper process that we call a \
         \"preloader\". However, the web application process that the preloader \
         started belongs to the wrong user. The UID of the web application \
         process should be {expected_uid}, but is actually {actual_uid}.</p>"
    )
}

pub(crate) fn problem_uid_query_failed_html(error: &str) -> String {
    format!(
        "<p>The {PROGRAM_NAME} application server tried to start the web \
         application. As part of the starting sequence, {SHORT_PROGRAM_NAME} \
         also tried to query the system user ID of the web application process \
         through the operating system's process table. However, an error was \
         encountered while doing that.</p>\
         <p>The error is as follows:</p><pre>{}</pre>",
        html_escape(error)
    )
}

pub(crate) fn problem_uid_query_no_info_html() -> String {
    format!(
        "<p>The {PROGRAM_NAME} application server tried to start the web \
         application. As part of the starting sequence, {SHORT_PROGRAM_NAME} \
         also tried to query the system user ID of the web application process \
         through the operating system's process table. However, the process \
         table did not return any information about the web application \
         process.</p>"
    )
}

pub(crate) fn solution_uid_query_html() -> String {
    let path = std::env::var("PATH").unwrap_or_default();
    let path = if path.is_empty() {
        "(empty)".to_string()
    } else {
        path
    };
    format!(
        "<div class=\"multiple-solutions\">\
         <h3>Check whether the process table is accessible by \
         {SHORT_PROGRAM_NAME}</h3>\
         <p>Maybe filesystem permissions or mount settings disallow \
         {SHORT_PROGRAM_NAME} from querying the process table. On many \
         operating systems this requires /proc to be mounted. Please check \
         these factors and fix them if necessary.</p>\
         <p>{SHORT_PROGRAM_NAME}'s PATH is:</p><pre>{}</pre>\
         <h3>Check whether the server is low on resources</h3>\
         <p>Maybe the server is currently low on resources. This would cause \
         process table queries to encounter errors. Please study the <em>error \
         message</em> and the <em>diagnostics reports</em> to verify whether \
         this is the case.</p>\
         <h3>Still no luck?</h3>\
         <p>Please try troubleshooting the problem by studying the \
         <em>diagnostics</em> reports.</p></div>",
        html_escape(&path)
    )
}

pub(crate) fn problem_field_errors_html(intro: &str, errors: &[String]) -> String {
    let mut message = format!("<p>{intro} The errors are as follows:</p><ul>");
    for error in errors {
        message.push_str("<li>");
        message.push_str(&html_escape(error));
        message.push_str("</li>");
    }
    message.push_str("</ul>");
    message
}

pub(crate) fn intro_internal_field_errors() -> String {
    format!(
        "The {PROGRAM_NAME} application server tried to start the web \
         application, but encountered a bug in {SHORT_PROGRAM_NAME} itself."
    )
}

pub(crate) fn intro_wrapper_field_errors() -> String {
    format!(
        "The {PROGRAM_NAME} application server tried to start the web \
         application through a {SHORT_PROGRAM_NAME}-internal helper tool (in \
         technical terms: the wrapper), but {SHORT_PROGRAM_NAME} encountered a \
         bug in this helper tool. {SHORT_PROGRAM_NAME} expected the helper tool \
         to communicate back various information about the application's \
         startup sequence, but the tool did not communicate back correctly."
    )
}

pub(crate) fn intro_app_field_errors() -> String {
    format!(
        "The {PROGRAM_NAME} application server tried to start the web \
         application, but encountered a bug in the application. \
         {SHORT_PROGRAM_NAME} expected the application to communicate back \
         various information about its startup sequence, but the application \
         did not communicate back correctly."
    )
}

pub(crate) fn problem_wrapper_no_sockets_html() -> String {
    format!(
        "<p>The {PROGRAM_NAME} application server tried to start the web \
         application through a {SHORT_PROGRAM_NAME}-internal helper tool (in \
         technical terms: the wrapper), but {SHORT_PROGRAM_NAME} encountered a \
         bug in this helper tool. {SHORT_PROGRAM_NAME} expected the helper tool \
         to report a socket to receive requests on, but the helper tool \
         finished its startup sequence without reporting a socket.</p>"
    )
}

pub(crate) fn problem_app_no_sockets_html() -> String {
    format!(
        "<p>The {PROGRAM_NAME} application server tried to start the web \
         application, but encountered a bug in the application. \
         {SHORT_PROGRAM_NAME} expected the application to report a socket to \
         receive requests on, but the application finished its startup sequence \
         without reporting a socket.</p>"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagehand_shared::journey::JourneyType;

    fn journey_with_failed(step: JourneyStep) -> Journey {
        let mut journey = Journey::new(JourneyType::SpawnDirectly, false);
        journey.set_errored(step, false).unwrap();
        journey
    }

    #[test]
    fn html_escape_covers_the_dangerous_five() {
        assert_eq!(
            html_escape("<a href=\"x\">&'</a>"),
            "&lt;a href=&quot;x&quot;&gt;&amp;&#39;&lt;/a&gt;"
        );
    }

    #[test]
    fn timeout_summary_is_journey_scoped() {
        let journey = journey_with_failed(JourneyStep::AppLoadOrExec);
        let summary = default_summary(ErrorCategory::TimeoutError, &journey, "ignored");
        assert!(summary.to_lowercase().contains("timeout"));
        assert!(!summary.contains("ignored"));

        let mut preloader_journey = Journey::new(JourneyType::StartPreloader, false);
        preloader_journey
            .set_errored(JourneyStep::HandshakePerform, false)
            .unwrap();
        let summary = default_summary(ErrorCategory::TimeoutError, &preloader_journey, "");
        assert!(summary.contains("preloader"));
    }

    #[test]
    fn summary_names_the_failed_activity() {
        let journey = journey_with_failed(JourneyStep::ForkSubprocess);
        let summary = default_summary(ErrorCategory::OperatingSystemError, &journey, "ENOMEM");
        assert!(summary.contains("An operating system error"));
        assert!(summary.contains("forking"));
        assert!(summary.ends_with("ENOMEM"));
    }

    #[test]
    fn problem_text_blames_the_app_for_app_failures() {
        let journey = journey_with_failed(JourneyStep::AppLoadOrExec);
        let problem = default_problem_html(ErrorCategory::InternalError, &journey, "");
        assert!(problem.contains("the application itself"));
        assert!(problem.starts_with("<p>"));
    }

    #[test]
    fn low_level_message_is_escaped_into_pre_block() {
        let journey = journey_with_failed(JourneyStep::OsShell);
        let problem =
            default_problem_html(ErrorCategory::OperatingSystemError, &journey, "a <b> c");
        assert!(problem.contains("<pre>a &lt;b&gt; c</pre>"));
        assert!(problem.contains("operating system is"));
    }

    #[test]
    fn timeout_solution_quotes_configured_timeout_and_step_hints() {
        let config = Config {
            app_root: "/srv/app".into(),
            start_command: "node app.js".into(),
            app_type: "node".into(),
            start_timeout_msec: 90_000,
            ..Config::default()
        };
        let journey = journey_with_failed(JourneyStep::AppLoadOrExec);
        let solution = default_solution_html(ErrorCategory::TimeoutError, &journey, &config);
        assert!(solution.contains("90 sec"));
        assert!(solution.contains("listen()"));

        let journey = journey_with_failed(JourneyStep::OsShell);
        let solution = default_solution_html(ErrorCategory::TimeoutError, &journey, &config);
        assert!(solution.contains("startup scripts"));
    }

    #[test]
    fn internal_error_solution_points_at_support() {
        let journey = journey_with_failed(JourneyStep::HandshakePerform);
        let solution = default_solution_html(
            ErrorCategory::InternalError,
            &journey,
            &Config::default(),
        );
        assert!(solution.contains(SUPPORT_URL));
    }
}
